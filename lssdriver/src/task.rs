use std::io;
use tokio::task::JoinHandle;

/// Runs `f` on the blocking pool. Task names are only recorded in `tracing` builds,
/// which also need `--cfg tokio_unstable`.
pub fn spawn_blocking_named<F, R>(name: &'static str, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    spawn_blocking_named_impl(name, f)
}

#[cfg(feature = "tracing")]
fn spawn_blocking_named_impl<F, R>(name: &'static str, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::Builder::new().name(name).spawn_blocking(f)
}

#[cfg(not(feature = "tracing"))]
fn spawn_blocking_named_impl<F, R>(_name: &'static str, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f))
}
