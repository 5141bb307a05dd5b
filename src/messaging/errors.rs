use thiserror::Error;

/// Failures raised by queue providers.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("queue storage failed during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("{operation} on queue {queue_name} failed: {message}")]
    Queue {
        queue_name: String,
        operation: String,
        message: String,
    },

    /// The message was acked, released or withdrawn by someone else.
    #[error("message {message_id} is no longer on its queue")]
    MessageNotFound { message_id: i64 },

    #[error("execution message payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl MessagingError {
    pub fn database_query(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Queue {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn message_not_found(message_id: i64) -> Self {
        Self::MessageNotFound { message_id }
    }
}
