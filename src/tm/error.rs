use std::fmt;

/// Error collector for teardown paths where every step must be attempted and
/// no single failure may short-circuit the others.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    /// Record the error side of a result, discarding the success value.
    pub fn record<T>(&mut self, res: anyhow::Result<T>) {
        if let Err(e) = res {
            self.errors.push(e);
        }
    }

    /// Fold another collector's errors into this one.
    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing was recorded, otherwise the collector itself.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred: {:#}", self.errors[0]);
        }
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n  * {err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn empty_collector_is_ok() {
        let merr = MultiError::new();
        assert!(merr.is_empty());
        assert!(merr.into_result().is_ok());
    }

    #[test]
    fn collects_and_reports_all_errors() {
        let mut merr = MultiError::new();
        merr.record::<()>(Err(anyhow!("mount teardown failed")));
        merr.record(Ok(42));
        merr.push(anyhow!("cgroup removal failed"));
        assert_eq!(merr.len(), 2);

        let err = merr.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("2 errors occurred"));
        assert!(text.contains("mount teardown failed"));
        assert!(text.contains("cgroup removal failed"));
    }

    #[test]
    fn single_error_renders_inline() {
        let mut merr = MultiError::new();
        merr.push(anyhow!("kill failed"));
        let text = merr.into_result().unwrap_err().to_string();
        assert!(text.starts_with("1 error occurred: kill failed"));
    }
}
