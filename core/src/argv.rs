//! Decides how a user's argv travels to the worker.
//!
//! An explicit `bash -c …` invocation passes through verbatim. Everything
//! else becomes a single shell snippet the worker wraps as
//! `bash -lc <snippet>`: a lone token is taken as an intentional snippet
//! (`pigeon 'cd x && make'`), multiple tokens are quote-joined. Tokens the
//! caller's shell already expanded from a `remote_env` key are rewritten
//! back to `$NAME` so the remote shell re-expands them with the worker's
//! value.

use std::collections::BTreeMap;

use thiserror::Error;

const SHELLS: &[&str] = &["bash", "/bin/bash", "sh", "/bin/sh", "zsh", "/bin/zsh"];

/// Shell operators that are meaningless as separate argv tokens; the
/// caller almost certainly wanted one quoted snippet.
const OPERATOR_TOKENS: &[&str] = &[
    "|", "||", ";", "&&", "&", ">", ">>", "<", "<<", "(", ")",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgvError {
    #[error("empty command")]
    Empty,

    #[error(
        "ambiguous shell operator token {token:?} in argv; quote the whole command: \
         pigeon '{hint}'"
    )]
    AmbiguousOperator { token: String, hint: String },
}

/// A normalized command ready to publish in `request.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCommand {
    pub argv: Vec<String>,
    pub use_shell: bool,
}

pub fn normalize(
    command: &[String],
    remote_env: &BTreeMap<String, String>,
) -> Result<NormalizedCommand, ArgvError> {
    if command.is_empty() {
        return Err(ArgvError::Empty);
    }

    if is_shell_c(command) {
        return Ok(NormalizedCommand {
            argv: command.to_vec(),
            use_shell: false,
        });
    }

    if command.len() == 1 {
        return Ok(NormalizedCommand {
            argv: vec![command[0].clone()],
            use_shell: true,
        });
    }

    if let Some(token) = command.iter().find(|t| OPERATOR_TOKENS.contains(&t.as_str())) {
        return Err(ArgvError::AmbiguousOperator {
            token: token.clone(),
            hint: command.join(" "),
        });
    }

    let rewritten = rewrite_local_expanded_tokens(command, remote_env);
    Ok(NormalizedCommand {
        argv: vec![shell_join(&rewritten)],
        use_shell: true,
    })
}

/// Treats an explicit `bash|sh|zsh -c …` (including combined short flags
/// like `-lc`) as already normalized.
fn is_shell_c(command: &[String]) -> bool {
    if command.len() < 2 || !SHELLS.contains(&command[0].as_str()) {
        return false;
    }
    command[1..].iter().any(|flag| {
        flag == "-c" || (flag.starts_with('-') && !flag.starts_with("--") && flag[1..].contains('c'))
    })
}

/// Quote-joins tokens, leaving bare `$NAME` / `${NAME}` references
/// unquoted so the remote shell expands them.
fn shell_join(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|token| {
            if is_var_reference(token) {
                token.clone()
            } else {
                shlex::try_quote(token)
                    .map(|quoted| quoted.into_owned())
                    .unwrap_or_else(|_| token.clone())
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_var_reference(token: &str) -> bool {
    let Some(body) = token.strip_prefix('$') else {
        return false;
    };
    let name = body
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(body);
    is_env_name(name)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Leading `NAME=value` tokens, as a shell would treat them.
fn prefix_assignments(command: &[String]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for token in command {
        let Some((name, value)) = token.split_once('=') else {
            break;
        };
        if !is_env_name(name) {
            break;
        }
        out.insert(name.to_string(), value.to_string());
    }
    out
}

/// Restores `$NAME` references the caller's shell expanded too early.
///
/// A token equal to the *local* value of a `remote_env` key came from the
/// caller's shell expanding `$NAME` before pigeon saw the argv; the worker
/// side has its own value, so the reference is restored. A token equal to
/// the local value of a leading `NAME=value` assignment is replaced by the
/// assignment's right-hand side.
fn rewrite_local_expanded_tokens(
    command: &[String],
    remote_env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut tokens = command.to_vec();
    let assignments = prefix_assignments(&tokens);
    if remote_env.is_empty() && assignments.is_empty() {
        return tokens;
    }
    let assignment_count = tokens
        .iter()
        .take_while(|t| {
            t.split_once('=')
                .is_some_and(|(name, _)| is_env_name(name))
        })
        .count();

    let mut candidates: Vec<&String> = remote_env.keys().chain(assignments.keys()).collect();
    candidates.sort();
    candidates.dedup();

    for token in tokens.iter_mut().skip(assignment_count) {
        for name in &candidates {
            let Ok(local_value) = std::env::var(name.as_str()) else {
                continue;
            };
            if local_value.is_empty() || *token != local_value {
                continue;
            }
            if let Some(rhs) = assignments.get(name.as_str()) {
                *token = rhs.clone();
            } else {
                *token = format!("${name}");
            }
            break;
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn toks(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_command_is_refused() {
        assert_eq!(normalize(&[], &BTreeMap::new()), Err(ArgvError::Empty));
    }

    #[test]
    fn explicit_shell_invocation_passes_verbatim() {
        let cmd = toks(&["bash", "-lc", "make -j"]);
        let normalized = normalize(&cmd, &BTreeMap::new()).expect("normalize");
        assert_eq!(normalized.argv, cmd);
        assert!(!normalized.use_shell);
    }

    #[test]
    fn single_token_is_a_snippet() {
        let normalized =
            normalize(&toks(&["cd build && make"]), &BTreeMap::new()).expect("normalize");
        assert_eq!(normalized.argv, vec!["cd build && make".to_string()]);
        assert!(normalized.use_shell);
    }

    #[test]
    fn multi_token_argv_is_quote_joined() {
        let normalized =
            normalize(&toks(&["echo", "hello world", "it's"]), &BTreeMap::new())
                .expect("normalize");
        assert_eq!(
            normalized.argv,
            vec![r#"echo "hello world" "it's""#.to_string()]
        );
        assert!(normalized.use_shell);
    }

    #[test]
    fn bare_var_references_stay_unquoted() {
        let normalized =
            normalize(&toks(&["echo", "$HOME", "${USER}"]), &BTreeMap::new()).expect("normalize");
        assert_eq!(normalized.argv, vec!["echo $HOME ${USER}".to_string()]);
    }

    #[test]
    fn operator_tokens_are_rejected_with_guidance() {
        let err = normalize(&toks(&["ls", "|", "wc"]), &BTreeMap::new()).expect_err("rejected");
        match err {
            ArgvError::AmbiguousOperator { token, hint } => {
                assert_eq!(token, "|");
                assert_eq!(hint, "ls | wc");
            }
            other => panic!("expected operator rejection, got {other:?}"),
        }
    }

    #[test]
    fn locally_expanded_remote_env_value_is_restored_to_reference() {
        let mut remote_env = BTreeMap::new();
        remote_env.insert("HTTP_PROXY".to_string(), "http://cpu:3128".to_string());

        // The caller's shell expanded `$HTTP_PROXY` to its local value
        // before pigeon saw the argv.
        // SAFETY: test-local env mutation; no other thread in this test
        // reads the variable concurrently.
        unsafe { std::env::set_var("HTTP_PROXY", "http://gpu:9") };
        let normalized = normalize(
            &toks(&["curl", "-x", "http://gpu:9", "example.com"]),
            &remote_env,
        )
        .expect("normalize");
        unsafe { std::env::remove_var("HTTP_PROXY") };

        assert_eq!(
            normalized.argv,
            vec!["curl -x $HTTP_PROXY example.com".to_string()]
        );
    }

    #[test]
    fn prefix_assignment_value_replaces_early_expansion() {
        // `VAR=new cmd $VAR` where the caller's shell expanded `$VAR` to
        // the old local value: the assignment right-hand side wins.
        // SAFETY: test-local env mutation, as above.
        unsafe { std::env::set_var("PIGEON_TEST_VAR", "old-value") };
        let normalized = normalize(
            &toks(&["PIGEON_TEST_VAR=new-value", "echo", "old-value"]),
            &BTreeMap::new(),
        )
        .expect("normalize");
        unsafe { std::env::remove_var("PIGEON_TEST_VAR") };

        assert_eq!(
            normalized.argv,
            vec!["PIGEON_TEST_VAR=new-value echo new-value".to_string()]
        );
    }
}
