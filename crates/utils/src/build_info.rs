/// Git metadata captured by the build script.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    git_dirty: Option<&'static str>,
}

impl BuildInfo {
    pub fn is_dirty(&self) -> bool {
        self.git_dirty == Some("true")
    }
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_literal_true_marks_the_tree_dirty() {
        let info = |git_dirty| BuildInfo {
            commit_sha1: None,
            git_dirty,
        };
        assert!(info(Some("true")).is_dirty());
        assert!(!info(Some("false")).is_dirty());
        assert!(!info(None).is_dirty());
    }
}
