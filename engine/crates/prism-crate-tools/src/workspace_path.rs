use std::path::{Path, PathBuf};

/// 统一路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let config = PrismPath::config_path("renderer.toml"); // config/renderer.toml
/// ```
pub struct PrismPath;
impl PrismPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // engine/crates/prism-crate-tools -> engine/crates -> engine -> workspace root
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.ancestors().nth(3).unwrap_or(manifest_dir).to_path_buf()
    }

    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_under_workspace() {
        let path = PrismPath::config_path("renderer.toml");
        assert!(path.starts_with(PrismPath::workspace_path()));
        assert!(path.ends_with("config/renderer.toml"));
    }
}
