use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// `<image>-<sha>[-dirty]`, reported by `--version` and at startup.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    compose(
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.is_dirty(),
    )
});

fn compose(image_version: &str, commit_sha1: Option<&str>, dirty: bool) -> String {
    let sha = commit_sha1
        .map(|sha| &sha[..sha.len().min(12)])
        .unwrap_or("unknown");
    let suffix = if dirty { "-dirty" } else { "" };
    format!("{image_version}-{sha}{suffix}")
}
