use std::thread::{Builder, JoinHandle};

/// Spawns the dedicated OS thread that drives one execution stream.
#[inline]
pub fn spawn<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().name(name).spawn(f)
}

/// Runs `f` on the given `rayon` pool, or inline when there is none.
#[cfg(feature = "rayon")]
#[inline]
pub fn install<T, F>(pool: Option<&rayon::ThreadPool>, f: F) -> T
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}
