//! Mailbox synchronization: incremental fetch and deletion reconciliation.

pub mod engine;
pub mod headers;
pub mod mime;
pub mod reconcile;

pub use engine::{SyncEngine, SyncResult};
pub use mime::{MimePart, extract_body};
pub use reconcile::Reconciler;

use crate::error::{AuthError, ProviderError, SyncError};

/// A mailbox 401 means the stored grant stopped working; the user has to
/// consent again, same as a rejected refresh.
pub(crate) fn mailbox_error(user_id: i64, error: ProviderError) -> SyncError {
    match error {
        ProviderError::Unauthorized { service } => SyncError::Auth(AuthError::Revoked {
            user_id,
            reason: format!("{service} rejected the access token"),
        }),
        other => SyncError::Provider(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_mailbox_requires_reauth() {
        let err = mailbox_error(4, ProviderError::Unauthorized { service: "gmail".into() });
        match err {
            SyncError::Auth(auth) => {
                assert!(auth.requires_reauth());
                assert!(auth.to_string().contains("gmail rejected the access token"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!mailbox_error(4, ProviderError::Unauthorized { service: "gmail".into() })
            .is_transient());
    }

    #[test]
    fn other_mailbox_errors_pass_through() {
        let err = mailbox_error(
            4,
            ProviderError::NotFound {
                service: "gmail".into(),
                id: "m1".into(),
            },
        );
        assert!(matches!(err, SyncError::Provider(ProviderError::NotFound { .. })));
    }
}
