//! `env_logger` setup shared by binaries and tests.

/// Installs the `RUST_LOG` driven logger. Returns `false` if a logger was
/// already installed, so calling it more than once is harmless.
pub fn init() -> bool {
    env_logger::Builder::from_default_env().try_init().is_ok()
}

/// Like [`init`] but with an explicit filter, e.g. `"reprise_core=debug"`.
pub fn init_with_filter(filter: &str) -> bool {
    env_logger::Builder::new()
        .parse_filters(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_with_filter("warn");
        assert!(!init());
    }
}
