use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<QueueError>,
    },

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<QueueError>),

    #[error("service shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Wrap this error with a short description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        QueueError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Combine an optional earlier error with a new one, flattening nested aggregates.
    pub fn append(existing: Option<QueueError>, next: QueueError) -> QueueError {
        let mut errors = match existing {
            None => return next,
            Some(QueueError::Aggregate(errors)) => errors,
            Some(err) => vec![err],
        };
        match next {
            QueueError::Aggregate(more) => errors.extend(more),
            err => errors.push(err),
        }
        QueueError::Aggregate(errors)
    }
}

fn join_messages(errors: &[QueueError]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => {
            let mut message = format!("{} errors occurred:", errors.len());
            for err in errors {
                message.push_str("\n\t* ");
                message.push_str(&err.to_string());
            }
            message
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
