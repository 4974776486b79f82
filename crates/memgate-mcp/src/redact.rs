const REDACTED: &str = "[REDACTED]";

/// Strips credentials from text that is about to leave the process.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            secrets: secrets
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), REDACTED);
        }
        for marker in ["api_key=", "key=", "token="] {
            out = redact_query_param(&out, marker);
        }
        out
    }
}

fn redact_query_param(input: &str, marker: &str) -> String {
    let mut s = input.to_string();
    let mut start = 0usize;
    while let Some(pos) = s.get(start..).and_then(|rest| rest.find(marker)) {
        let abs = start + pos + marker.len();
        let tail = s.get(abs..).unwrap_or_default();
        if tail.starts_with(REDACTED) {
            start = abs + REDACTED.len();
            continue;
        }
        let end_rel = tail
            .find(['&', ' ', '"', '\'', ')', '\n'])
            .unwrap_or(tail.len());
        s.replace_range(abs..abs + end_rel, REDACTED);
        start = abs + REDACTED.len();
    }
    s
}
