//! `log` + `env_logger` is the ecosystem's default pairing for a CLI binary
//! that just needs `RUST_LOG`-driven output.

pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
