//! Runtime-flag allow-listing.
//!
//! Users may pass engine flags through `configure`.  Only keys on the
//! per-engine whitelist are accepted, and values are screened against
//! argument smuggling: no path separators anywhere, and no `--key=value`
//! whose value is itself a flag (`--seed=--log-file=x`).  Flags the system
//! composes itself (model location, listen address, mode flags, projector)
//! are reserved and can never be overridden.

use crate::backend::BackendKind;
use crate::error::RunnerError;
use crate::sanitize::sanitize_for_log;

/// Flags the scheduler owns; rejected regardless of whitelist.
const RESERVED: &[&str] = &[
    "model",
    "model-path",
    "model-draft",
    "host",
    "port",
    "unix-socket",
    "embeddings",
    "reranking",
    "runner",
    "mmproj",
    "chat-template-file",
];

/// Per-engine whitelist of user-settable flag keys (without `--`).
fn whitelist(kind: BackendKind) -> &'static [&'static str] {
    match kind {
        BackendKind::Gguf => &[
            "threads",
            "batch-size",
            "ubatch-size",
            "n-gpu-layers",
            "flash-attn",
            "mlock",
            "no-mmap",
            "parallel",
            "seed",
            "temp",
            "top-k",
            "top-p",
            "repeat-penalty",
            "cache-type-k",
            "cache-type-v",
        ],
        BackendKind::Safetensors => &[
            "tensor-parallel-size",
            "gpu-memory-utilization",
            "max-num-seqs",
            "dtype",
            "seed",
            "enforce-eager",
        ],
        BackendKind::Mlx => &["temp", "top-p", "seed", "max-kv-size"],
        BackendKind::Diffusion => &["seed", "steps", "guidance-scale"],
    }
}

/// Validate `flags` against `kind`'s whitelist, returning them unchanged on
/// success.
pub fn validate(kind: BackendKind, flags: &[String]) -> Result<Vec<String>, RunnerError> {
    let allowed = whitelist(kind);
    // Whether the previous token was a `--key` that may still take a value.
    // Arity is not tracked per flag; boolean flags simply leave the slot
    // unused and the next `--key` closes it.
    let mut key_open = false;

    for token in flags {
        if let Some(rest) = token.strip_prefix("--") {
            let (key, value) = match rest.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (rest, None),
            };
            if RESERVED.contains(&key) {
                return Err(reject(token, "flag is reserved"));
            }
            if !allowed.contains(&key) {
                return Err(reject(token, "flag is not on the engine whitelist"));
            }
            if has_separator(key) {
                return Err(reject(token, "flag key contains a path separator"));
            }
            match value {
                Some(v) => {
                    check_value(token, v)?;
                    key_open = false;
                }
                None => key_open = true,
            }
        } else {
            if !key_open {
                return Err(reject(token, "value without a preceding flag"));
            }
            check_value(token, token)?;
            key_open = false;
        }
    }

    Ok(flags.to_vec())
}

fn check_value(token: &str, value: &str) -> Result<(), RunnerError> {
    if has_separator(value) {
        return Err(reject(token, "flag value contains a path separator"));
    }
    // `--seed=-1` is a legitimate negative number; `--seed=--log-file=x`
    // is an injected flag.
    if let Some(rest) = value.strip_prefix('-') {
        let ok = rest
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '.')
            .unwrap_or(false);
        if !ok {
            return Err(reject(token, "flag value looks like another flag"));
        }
    }
    Ok(())
}

fn has_separator(s: &str) -> bool {
    s.contains('/') || s.contains('\\')
}

fn reject(token: &str, why: &str) -> RunnerError {
    RunnerError::invalid(format!(
        "runtime flag {:?} rejected: {why}",
        sanitize_for_log(token)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(flags: &[&str]) -> Result<Vec<String>, RunnerError> {
        validate(
            BackendKind::Gguf,
            &flags.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn whitelisted_key_value_pair_passes() {
        assert!(v(&["--threads", "4"]).is_ok());
        assert!(v(&["--temp", "0.2", "--top-k", "50"]).is_ok());
    }

    #[test]
    fn equals_form_passes() {
        assert!(v(&["--seed=42"]).is_ok());
    }

    #[test]
    fn negative_numeric_values_pass() {
        assert!(v(&["--seed=-1"]).is_ok());
        assert!(v(&["--seed", "-1"]).is_ok());
    }

    #[test]
    fn boolean_flags_pass_without_values() {
        assert!(v(&["--mlock", "--flash-attn"]).is_ok());
    }

    #[test]
    fn injected_flag_as_separate_value_is_blocked() {
        assert!(v(&["--seed", "--log-file=x"]).is_err());
    }

    #[test]
    fn flag_injection_via_equals_value_is_blocked() {
        let err = v(&["--seed=--log-file=x"]).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRequest { .. }));
    }

    #[test]
    fn path_separators_are_blocked() {
        assert!(v(&["--cache-type-k", "q8/0"]).is_err());
        assert!(v(&["--seed=..\\x"]).is_err());
    }

    #[test]
    fn reserved_flags_are_blocked_even_if_plausible() {
        assert!(v(&["--model", "x"]).is_err());
        assert!(v(&["--host=0.0.0.0"]).is_err());
        assert!(v(&["--embeddings"]).is_err());
    }

    #[test]
    fn unknown_keys_are_blocked() {
        assert!(v(&["--log-file", "x"]).is_err());
    }

    #[test]
    fn dangling_value_is_blocked() {
        assert!(v(&["4"]).is_err());
    }

    #[test]
    fn whitelists_differ_per_engine() {
        let flags = vec!["--tensor-parallel-size".to_string(), "2".to_string()];
        assert!(validate(BackendKind::Safetensors, &flags).is_ok());
        assert!(validate(BackendKind::Gguf, &flags).is_err());
    }
}
