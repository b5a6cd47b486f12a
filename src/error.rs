use thiserror::Error;

pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_PROVIDER: i32 = 3;
pub const EXIT_IO: i32 = 4;
pub const EXIT_UNEXPECTED: i32 = 5;

/// Stage-level failure classes. Each one maps to a process exit code.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("file error: {0}")]
    Io(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Validation(_) => EXIT_VALIDATION,
            PipelineError::Provider(_) => EXIT_PROVIDER,
            PipelineError::Io(_) => EXIT_IO,
        }
    }
}

/// Walks the error chain and picks the first classified failure.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(p) = cause.downcast_ref::<PipelineError>() {
            return p.exit_code();
        }
        if let Some(o) = cause.downcast_ref::<crate::outline::OutlineError>() {
            return o.exit_code();
        }
        if cause.downcast_ref::<crate::llm::LlmError>().is_some() {
            return EXIT_PROVIDER;
        }
        if cause.downcast_ref::<crate::tts::TtsError>().is_some() {
            return EXIT_PROVIDER;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EXIT_IO;
        }
    }
    EXIT_UNEXPECTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classified_errors_survive_context() {
        let err = Err::<(), _>(PipelineError::Validation("no segments".into()))
            .context("building episode")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_VALIDATION);
    }

    #[test]
    fn io_errors_map_to_file_code() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = anyhow::Error::new(io).context("reading osnova.json");
        assert_eq!(exit_code_for(&err), EXIT_IO);
    }

    #[test]
    fn unknown_errors_are_unexpected() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), EXIT_UNEXPECTED);
    }
}
