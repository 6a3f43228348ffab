use strum::Display;

/// Pipeline stage that produced a [`RunError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Configuration,
    Authentication,
    Connection,
    Transfer,
    Execution,
}

/// Terminal failure of a run, tagged with the stage that failed.
///
/// Each variant carries the [`anyhow`] context chain built up inside the
/// stage. Nothing in this crate retries on any of these.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("configuration failed: {0:#}")]
    Configuration(anyhow::Error),

    #[error("authentication failed: {0:#}")]
    Authentication(anyhow::Error),

    #[error("connection failed: {0:#}")]
    Connection(anyhow::Error),

    #[error("transfer failed: {0:#}")]
    Transfer(anyhow::Error),

    #[error("execution failed: {0:#}")]
    Execution(anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn new(stage: Stage, error: anyhow::Error) -> Self {
        match stage {
            Stage::Configuration => Self::Configuration(error),
            Stage::Authentication => Self::Authentication(error),
            Stage::Connection => Self::Connection(error),
            Stage::Transfer => Self::Transfer(error),
            Stage::Execution => Self::Execution(error),
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Configuration(_) => Stage::Configuration,
            Self::Authentication(_) => Stage::Authentication,
            Self::Connection(_) => Stage::Connection,
            Self::Transfer(_) => Stage::Transfer,
            Self::Execution(_) => Stage::Execution,
        }
    }

    /// Underlying cause, without the stage prefix.
    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Self::Configuration(e)
            | Self::Authentication(e)
            | Self::Connection(e)
            | Self::Transfer(e)
            | Self::Execution(e) => e,
        }
    }
}

/// Tags a stage-internal [`anyhow::Result`] with the [`Stage`] it belongs to.
pub trait StageContext<T> {
    /// # Errors
    ///
    /// If `self` is an error, it is wrapped into the [`RunError`] variant for
    /// `stage`.
    fn stage(self, stage: Stage) -> Result<T, RunError>;
}

impl<T, E> StageContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> Result<T, RunError> {
        self.map_err(|error| RunError::new(stage, error.into()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use anyhow::Context;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Stage::Configuration, "configuration")]
    #[case(Stage::Authentication, "authentication")]
    #[case(Stage::Connection, "connection")]
    #[case(Stage::Transfer, "transfer")]
    #[case(Stage::Execution, "execution")]
    fn stage_round_trips(#[case] stage: Stage, #[case] name: &str) {
        let error = RunError::new(stage, anyhow!("boom"));
        assert_eq!(error.stage(), stage);
        assert_eq!(stage.to_string(), name);
        assert_eq!(error.to_string(), format!("{name} failed: boom"));
    }

    #[test]
    fn display_includes_context_chain() {
        let result: anyhow::Result<()> = Err(anyhow!("connection refused"));
        let error = result
            .context("TCP connect failed")
            .stage(Stage::Connection)
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "connection failed: TCP connect failed: connection refused"
        );
        assert_eq!(error.cause().to_string(), "TCP connect failed");
    }
}
