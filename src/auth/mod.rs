//! Provider credentials: storage, validity, and refresh.

pub mod credential;
pub mod manager;
pub mod token_endpoint;

pub use credential::{Credential, EXPIRY_SKEW_SECS, Validity};
pub use manager::{AuthorizationGrant, CredentialManager};
pub use token_endpoint::{GOOGLE_TOKEN_URI, GoogleTokenEndpoint, RefreshedToken, TokenEndpoint};
