use std::collections::HashMap;

/// Environment of a supervised task.
///
/// Doubles as the `${VAR}` templater applied to the command, its arguments
/// and the dynamic service/check fields before they leave the executor.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    vars: HashMap<String, String>,
}

impl TaskEnv {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Resolve `${VAR}` placeholders against the task environment.
    ///
    /// Placeholders with no matching variable are left untouched so the
    /// consumer can tell an unset variable from an empty one.
    pub fn replace(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.vars.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated placeholder; emit verbatim.
                    out.push_str("${");
                    rest = after;
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// [`replace`](Self::replace) applied element-wise.
    pub fn replace_all(&self, raw: &[String]) -> Vec<String> {
        raw.iter().map(|s| self.replace(s)).collect()
    }

    /// Environment list handed to the child process, sorted for determinism.
    pub fn env_list(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        list.sort();
        list
    }
}
