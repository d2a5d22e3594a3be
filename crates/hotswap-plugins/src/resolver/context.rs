//! Scoped "current resolver" for code running on behalf of a module.

use std::future::Future;
use std::sync::Arc;

use super::Resolver;

tokio::task_local! {
    static CURRENT_RESOLVER: Arc<dyn Resolver>;
}

/// Run `f` with `resolver` as the current resolver. The previous value, if
/// any, is visible again once `f` returns or unwinds.
pub fn with_resolver<R>(resolver: Arc<dyn Resolver>, f: impl FnOnce() -> R) -> R {
    CURRENT_RESOLVER.sync_scope(resolver, f)
}

/// Async form of [`with_resolver`]; the value follows the future across
/// `.await` points.
pub async fn scope_resolver<F>(resolver: Arc<dyn Resolver>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_RESOLVER.scope(resolver, fut).await
}

/// Resolver installed by the innermost enclosing scope.
pub fn current_resolver() -> Option<Arc<dyn Resolver>> {
    CURRENT_RESOLVER.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::HostResolver;

    fn host_with(name: &str) -> Arc<dyn Resolver> {
        let host = HostResolver::new();
        host.register(name, name.as_bytes().to_vec());
        Arc::new(host)
    }

    #[test]
    fn test_nesting_restores_outer_resolver() {
        assert!(current_resolver().is_none());

        let outer = host_with("outer");
        let inner = host_with("inner");

        with_resolver(outer, || {
            assert!(current_resolver().unwrap().resolve("outer").is_ok());

            with_resolver(inner, || {
                let current = current_resolver().unwrap();
                assert!(current.resolve("inner").is_ok());
                assert!(current.resolve("outer").is_err());
            });

            assert!(current_resolver().unwrap().resolve("outer").is_ok());
        });

        assert!(current_resolver().is_none());
    }

    #[test]
    fn test_restored_after_panic() {
        let outer = host_with("outer");
        with_resolver(outer, || {
            let result = std::panic::catch_unwind(|| {
                with_resolver(host_with("inner"), || panic!("activation blew up"));
            });
            assert!(result.is_err());
            assert!(current_resolver().unwrap().resolve("outer").is_ok());
        });
    }

    #[tokio::test]
    async fn test_scope_survives_await() {
        let value = scope_resolver(host_with("async"), async {
            tokio::task::yield_now().await;
            current_resolver().map(|r| r.resolve("async").is_ok())
        })
        .await;
        assert_eq!(value, Some(true));
        assert!(current_resolver().is_none());
    }
}
