//! Bridges an arbitrary `Future` into the interpreter via [`Effect::single`]. Requires the
//! optional `tokio` feature; without it, `Effect::single`/`Effect::async_effect` remain the only
//! way to bring async work into the interpreter, with no hard runtime dependency.

use crate::effect::Effect;

impl<A: Send + 'static> Effect<A> {
    /// Spawns `future` on the ambient `tokio` runtime (via [`tokio::spawn`]) and resumes the
    /// interpreter with its output once it completes. `future` is spawned as its own supervised
    /// task so that a panic inside it is caught by `tokio`'s own `JoinHandle` machinery rather than
    /// silently aborting the outer task that would otherwise have called `cont.resume`; such a
    /// panic surfaces as [`crate::EffectError::Raised`] wrapping the `JoinError`, the same shape a
    /// panic inside [`Effect::lazy`] takes.
    pub fn from_future<F>(future: F) -> Self
    where
        F: std::future::Future<Output = A> + Send + 'static,
    {
        Effect::single(move |_ctx, cont| {
            let handle = tokio::spawn(future);
            tokio::spawn(async move {
                match handle.await {
                    Ok(output) => cont.resume(output),
                    Err(join_err) => cont.resume_with_error(crate::error::EffectError::raised(join_err)),
                }
            });
        })
    }

    /// Like [`Effect::from_future`], but for a future that itself yields a `Result`; the error
    /// channel surfaces through [`crate::EffectError::Raised`] rather than through the success
    /// value, the same shape [`Effect::try_lazy`] gives synchronous fallible work. Also spawns
    /// `future` as its own supervised task so a panic inside it surfaces as
    /// [`crate::EffectError::Raised`] instead of stranding the continuation.
    pub fn from_try_future<F, E>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<A, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Effect::single(move |_ctx, cont| {
            let handle = tokio::spawn(future);
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(value)) => cont.resume(value),
                    Ok(Err(err)) => cont.resume_with_error(crate::error::EffectError::raised(err)),
                    Err(join_err) => cont.resume_with_error(crate::error::EffectError::raised(join_err)),
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::suspend_run;

    #[tokio::test]
    async fn from_future_resumes_with_its_output() {
        let effect: Effect<i32> = Effect::from_future(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            7
        });
        let result = tokio::task::spawn_blocking(move || suspend_run(effect)).await.unwrap();
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn from_try_future_surfaces_errors() {
        let effect: Effect<i32> = Effect::from_try_future(async {
            Err::<i32, _>(std::io::Error::other("future failed"))
        });
        let result = tokio::task::spawn_blocking(move || suspend_run(effect)).await.unwrap();
        assert!(result.unwrap_err().to_string().contains("future failed"));
    }
}
