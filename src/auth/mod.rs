//! Frontend authentication.
//!
//! With an empty credential store every session is trusted and goes
//! straight to `AuthenticationOk`. Otherwise the session runs a
//! SCRAM-SHA-256 exchange (see [`scram`]); any failure there is fatal for
//! the session.

use crate::error::{ProxyError, ProxyResult};
use crate::messages::startup::Startup;

pub mod scram;

pub const METADATA_USER: &str = "user";
pub const METADATA_DATABASE: &str = "database";
pub const METADATA_APPLICATION_NAME: &str = "application_name";

/// Where a session is in its authentication exchange.
pub enum AuthPhase {
    NotStarted,
    /// SASL mechanism advertised, waiting for SASLInitialResponse.
    SaslAdvertised,
    /// server-first sent, waiting for the client proof.
    SaslInProgress(scram::ScramExchange),
    Complete,
}

/// Validate a startup packet: protocol 3.0 and a `user` parameter are
/// required, everything else is taken as-is.
pub fn validate_startup(startup: &Startup) -> ProxyResult<()> {
    if (startup.protocol_number_major, startup.protocol_number_minor)
        != crate::messages::startup::PROTOCOL_VERSION_3_0
    {
        return Err(ProxyError::UnsupportedProtocolVersion(
            startup.protocol_number_major,
            startup.protocol_number_minor,
        ));
    }

    if startup
        .parameters
        .get(METADATA_USER)
        .map(|u| u.is_empty())
        .unwrap_or(true)
    {
        return Err(ProxyError::UserNameRequired);
    }

    Ok(())
}

/// Parameter set reported to clients right after `AuthenticationOk`.
///
/// The values mirror what a stock server advertises so that drivers which
/// key behavior off them (datetime handling, string literals) work
/// unchanged.
pub fn server_parameters(
    user: &str,
    application_name: Option<&str>,
) -> Vec<(String, String)> {
    let mut params = vec![
        (
            "server_version".to_owned(),
            format!("16.6-pgmirror-{}", env!("CARGO_PKG_VERSION")),
        ),
        ("server_encoding".to_owned(), "UTF8".to_owned()),
        ("client_encoding".to_owned(), "UTF8".to_owned()),
        ("DateStyle".to_owned(), "ISO, MDY".to_owned()),
        ("integer_datetimes".to_owned(), "on".to_owned()),
        ("standard_conforming_strings".to_owned(), "on".to_owned()),
        ("session_authorization".to_owned(), user.to_owned()),
    ];
    if let Some(application_name) = application_name {
        params.push((
            "application_name".to_owned(),
            application_name.to_owned(),
        ));
    }
    params
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_startup_requires_user() {
        let mut startup = Startup::default();
        assert!(matches!(
            validate_startup(&startup),
            Err(ProxyError::UserNameRequired)
        ));

        startup
            .parameters
            .insert("user".to_owned(), "alice".to_owned());
        assert!(validate_startup(&startup).is_ok());
    }

    #[test]
    fn test_validate_startup_requires_protocol_3_0() {
        let mut startup = Startup::default();
        startup
            .parameters
            .insert("user".to_owned(), "alice".to_owned());
        startup.protocol_number_minor = 2;

        assert!(matches!(
            validate_startup(&startup),
            Err(ProxyError::UnsupportedProtocolVersion(3, 2))
        ));
    }

    #[test]
    fn test_server_parameters_follow_client() {
        let params = server_parameters("alice", Some("psql"));
        assert!(params.iter().any(|(k, v)| k == "session_authorization" && v == "alice"));
        assert!(params.iter().any(|(k, v)| k == "application_name" && v == "psql"));

        let params = server_parameters("alice", None);
        assert!(!params.iter().any(|(k, _)| k == "application_name"));
    }
}
