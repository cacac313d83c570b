//! Fallback attempt ordering

/// Ordered, de-duplicated list of models to try: requested, default, fallback.
pub fn build_attempts(requested: &str, default: &str, fallback: &str) -> Vec<String> {
    let mut attempts: Vec<String> = Vec::with_capacity(3);
    for candidate in [requested, default, fallback] {
        if candidate.is_empty() || attempts.iter().any(|a| a == candidate) {
            continue;
        }
        attempts.push(candidate.to_string());
    }
    attempts
}
