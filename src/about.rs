pub const COVSEQ_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COVSEQ_BUILD_N: &str = env!("COVSEQ_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "covseq-pool {}\nBuild {}\nPCR sample pooling and liquid-handler worklists",
        COVSEQ_VERSION, COVSEQ_BUILD_N
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_text() {
        let text = version_cli_text();
        assert!(text.starts_with("covseq-pool "));
        assert!(text.contains(COVSEQ_VERSION));
    }
}
