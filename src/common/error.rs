use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file invalid: {0}")]
    Config(#[from] toml::de::Error),

    #[error("environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("{kind} not registered: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("collection {collection}: itemize failed for record {record}: {source}")]
    Itemize {
        collection: String,
        record: String,
        #[source]
        source: Box<AuditError>,
    },

    #[error("missing required field: {0}")]
    MissingField(String),
}

impl AuditError {
    pub fn api(message: impl Into<String>) -> Self {
        AuditError::Api {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        AuditError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;
