//! DNS-SRV bootstrap expansion: a single bare hostname may stand for the
//! whole cluster through `_shoal._tcp` / `_shoals._tcp` records.

use shoal_core::error::Error;

/// Resolve SRV records for `name` into (target, port) pairs using the
/// system resolver configuration.
pub async fn resolve_srv(name: &str) -> Result<Vec<(String, u16)>, Error> {
    let resolver =
        hickory_resolver::TokioAsyncResolver::tokio_from_system_conf().map_err(resolve_error)?;
    let lookup = resolver.srv_lookup(name).await.map_err(resolve_error)?;
    Ok(lookup
        .iter()
        .map(|record| {
            let target = record.target().to_utf8();
            let target = target.trim_end_matches('.').to_string();
            (target, record.port())
        })
        .collect())
}

fn resolve_error(err: hickory_resolver::error::ResolveError) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}
