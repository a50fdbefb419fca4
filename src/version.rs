pub const LABEL: &str = env!("WEBTERM_VERSION_LABEL");
pub const GIT_SHA: &str = env!("WEBTERM_GIT_SHA");
pub const BUILD_TIME: &str = env!("WEBTERM_BUILD_TIME");

pub const VERSION: &str = if GIT_SHA.is_empty() {
    concat!(
        env!("WEBTERM_VERSION_LABEL"),
        " (built ",
        env!("WEBTERM_BUILD_TIME"),
        ")"
    )
} else {
    concat!(
        env!("WEBTERM_VERSION_LABEL"),
        " (git ",
        env!("WEBTERM_GIT_SHA"),
        ", built ",
        env!("WEBTERM_BUILD_TIME"),
        ")"
    )
};

pub fn git_sha() -> Option<&'static str> {
    (!GIT_SHA.is_empty()).then_some(GIT_SHA)
}
