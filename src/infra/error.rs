use std::net::SocketAddr;

use thiserror::Error;

/// Failures while bringing the process up: listener, database, logging, config.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {message}")]
    Database { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::io(format!("failed to bind listener on {addr}"), source)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn bind_failure_names_the_address() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().expect("addr");
        let err = InfraError::bind(
            addr,
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        );

        assert_eq!(
            err.to_string(),
            "failed to bind listener on 127.0.0.1:3000: address in use"
        );
        assert!(err.source().is_some());
    }
}
