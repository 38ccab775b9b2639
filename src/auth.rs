//! gRPC interceptor that attaches Basic credentials to outgoing requests.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Username and password presented to the log service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Build credentials from a username/password pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:pass)>` header value.
    fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// gRPC interceptor that injects an `authorization: Basic ...` header.
///
/// The header value is computed once when the interceptor is built. With no
/// credentials, or an empty username, no header is added.
#[derive(Clone, Default)]
pub(crate) struct CredentialsInterceptor {
    header: Option<tonic::metadata::MetadataValue<tonic::metadata::Ascii>>,
}

impl CredentialsInterceptor {
    /// Build an interceptor for the given credentials.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] if the encoded header is not valid metadata.
    pub(crate) fn new(credentials: Option<&Credentials>) -> Result<Self, tonic::Status> {
        let header = match credentials {
            Some(c) if !c.username.is_empty() => Some(
                c.header_value()
                    .parse()
                    .map_err(|_| tonic::Status::internal("invalid credential characters"))?,
            ),
            _ => None,
        };
        Ok(Self { header })
    }
}

impl tonic::service::Interceptor for CredentialsInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(value) = &self.header {
            req.metadata_mut().insert("authorization", value.clone());
        }
        Ok(req)
    }
}
