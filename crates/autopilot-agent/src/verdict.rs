use std::sync::LazyLock;

use regex::Regex;

/// Review verdict: approved iff the text says APPROVE and never REQUEST_CHANGES.
pub fn is_approved(text: &str) -> bool {
    let upper = text.to_uppercase();
    upper.contains("APPROVE") && !upper.contains("REQUEST_CHANGES")
}

/// Security verdict: passed iff the text says PASS and never FAIL.
pub fn is_passed(text: &str) -> bool {
    let upper = text.to_uppercase();
    upper.contains("PASS") && !upper.contains("FAIL")
}

/// `https://github.com/<owner>/<repo>/pull/<n>`, compiled on first use.
static PR_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+").ok());

/// First GitHub pull-request URL in `text`.
pub fn extract_pr_url(text: &str) -> Option<String> {
    let re = PR_URL.as_ref()?;
    re.find(text).map(|m| m.as_str().to_string())
}
