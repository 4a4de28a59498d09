use once_cell::sync::OnceCell;

pub static INIT_CRYPTO: OnceCell<()> = OnceCell::new();

pub fn init_crypto() {
    INIT_CRYPTO.get_or_init(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::trace!("rustls crypto provider already installed");
        }
    });
}
