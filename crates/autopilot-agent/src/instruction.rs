use autopilot_core::types::Defect;
use chrono::{DateTime, Utc};

pub const FIX_SYSTEM_PROMPT: &str = "\
You are an autonomous senior developer fixing a production bug. You are working \
in a git worktree on a dedicated branch. Your goal is to investigate the error, \
apply a minimal fix, verify it, and open a pull request.

Follow these phases in order. Do not skip any phase.

### Phase 1: Investigate the error

Use the Sentry MCP tools to fetch the issue details, its latest events and the \
full stacktrace with source context. Never call the Sentry HTTP API directly; \
the MCP server is already authenticated.

### Phase 2: Explore the relevant code

Read the files named in the stacktrace, trace the execution path that leads to \
the failure and identify the root cause, not just the symptom.

### Phase 3: Apply the fix

- Only modify files directly related to the error.
- Keep the change minimal. Do not refactor unrelated code.
- Do not add new dependencies.
- Do not modify tests unless the test itself is wrong.
- Follow the existing code patterns and conventions.

### Phase 4: Verify the fix

Run the project's formatters, linters, type checks and test suites. If any \
check fails, fix the problem and run the checks again.

### Phase 5: Commit and open the PR

1. Stage only the files you changed (never `git add -A`).
2. Commit with a message of the form `fix: <what was fixed>` and a trailer \
   line `Sentry: <permalink>`.
3. Push the current branch with `git push -u origin HEAD`.
4. Run `gh pr create` with a body covering the error (with its Sentry link), \
   the root cause, what changed and the verification results.

End your final message with the PR URL on its own line.

Rules: never push to main, never edit README or configuration files, and if \
you cannot fix the issue explain why in detail.
";

pub const REVIEW_SYSTEM_PROMPT: &str = "\
You are a code reviewer. You will receive a PR diff that claims to fix a \
production error. Review it for:
1. Correctness: does the fix address the reported error?
2. Code quality: is it clean and consistent with the project?
3. Regressions: could the change break anything else?
4. Completeness: is anything missing?

Respond with:
- VERDICT: APPROVE or REQUEST_CHANGES
- SUMMARY: 2-3 sentences
- ISSUES: problems found (empty if none)

Be pragmatic. If the fix is correct and safe, approve it. Do not nitpick style.
";

pub const SECURITY_SYSTEM_PROMPT: &str = "\
You are a security engineer auditing a code change. Review the PR diff for \
SQL injection, XSS, path traversal, authentication or authorization bypass, \
exposed secrets, command injection, SSRF and insecure deserialization.

Respond with:
- VERDICT: PASS or FAIL
- RISK_LEVEL: LOW, MEDIUM, HIGH or CRITICAL
- FINDINGS: issues found (empty if none)
- SUMMARY: 1-2 sentences

Only flag real security concerns. Avoid false positives. Do not use the word \
FAIL anywhere unless the verdict is FAIL.
";

/// Read-only tools for the audit capabilities.
pub const AUDIT_TOOLS: &str = "Read,Glob,Grep";

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

pub fn fix_prompt(defect: &Defect) -> String {
    let ts = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
    let reference = if defect.short_id.is_empty() {
        &defect.id
    } else {
        &defect.short_id
    };
    format!(
        "Fix this production error from Sentry:\n\n\
         **Issue ID:** {id}\n\
         **Short ID:** {short_id}\n\
         **Title:** {title}\n\
         **Culprit:** {culprit}\n\
         **Level:** {level}\n\
         **Occurrences:** {count}\n\
         **First seen:** {first_seen}\n\
         **Last seen:** {last_seen}\n\
         **Sentry URL:** {permalink}\n\n\
         **Stacktrace:**\n```\n{stacktrace}\n```\n\n\
         Start by using the Sentry MCP tools to get the full error details and stacktrace \
         for issue {reference}. Then follow your workflow to investigate, fix, verify, \
         and open a PR.",
        id = defect.id,
        short_id = or_dash(&defect.short_id),
        title = defect.title,
        culprit = defect.culprit,
        level = defect.level.as_str(),
        count = defect.occurrence_count,
        first_seen = ts(defect.first_seen),
        last_seen = ts(defect.last_seen),
        permalink = or_dash(&defect.permalink),
        stacktrace = defect.stacktrace,
    )
}

pub fn review_prompt(diff: &str, defect_context: &str) -> String {
    format!(
        "Review this PR that fixes a production error.\n\n\
         **Original error context:**\n{defect_context}\n\n\
         **PR Diff:**\n```diff\n{diff}\n```\n\n\
         Provide your review with VERDICT, SUMMARY, and ISSUES.\n"
    )
}

pub fn security_prompt(diff: &str, defect_context: &str) -> String {
    format!(
        "Audit these code changes for security vulnerabilities.\n\n\
         **Error being fixed:**\n{defect_context}\n\n\
         ```diff\n{diff}\n```\n\n\
         Also read any files that the diff touches to understand the full context.\n\
         Provide your assessment with VERDICT, RISK_LEVEL, FINDINGS, and SUMMARY.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_prompt_names_the_issue_and_trace() {
        let d = Defect {
            id: "42".into(),
            short_id: "SHOP-1A".into(),
            title: "KeyError: 'price'".into(),
            culprit: "app/server.py in search".into(),
            occurrence_count: 17,
            stacktrace: "KeyError: 'price'\n  at app/server.py in search".into(),
            ..Default::default()
        };
        let p = fix_prompt(&d);
        assert!(p.contains("**Issue ID:** 42"));
        assert!(p.contains("**Occurrences:** 17"));
        assert!(p.contains("**Sentry URL:** -"));
        assert!(p.contains("for issue SHOP-1A."));
        assert!(p.contains("at app/server.py in search"));
    }

    #[test]
    fn audit_prompts_embed_diff_and_context() {
        let r = review_prompt("+fixed", "KeyError: 'price'");
        assert!(r.contains("```diff\n+fixed\n```"));
        assert!(r.contains("KeyError: 'price'"));
        let s = security_prompt("+fixed", "KeyError");
        assert!(s.contains("RISK_LEVEL"));
        assert!(s.contains("+fixed"));
    }
}
