use kernels::builtin_images;
use offload::{OffloadError, SessionConfig, TransferSession};
use runtime_native::NativePlatform;
use transport::ImageEntry;

/// A platform with the built-in kernels plus `extra` images.
pub fn platform_with(extra: &[(&'static str, ImageEntry)]) -> NativePlatform {
    builtin_images()
        .into_iter()
        .chain(extra.iter().copied())
        .fold(NativePlatform::new(), |platform, (name, entry)| {
            platform.with_image(name, entry)
        })
}

pub fn platform() -> NativePlatform {
    platform_with(&[])
}

pub fn open(platform: &NativePlatform, config: SessionConfig) -> TransferSession {
    let link = platform.host_link().expect("host link");
    TransferSession::create(link, config).unwrap_or_else(|err| panic!("session setup: {err}"))
}

pub fn open_err(platform: &NativePlatform, config: SessionConfig) -> OffloadError {
    let link = platform.host_link().expect("host link");
    match TransferSession::create(link, config) {
        Ok(_) => panic!("session setup unexpectedly succeeded"),
        Err(err) => err,
    }
}
