use std::path::Path;

use serde_json::Value;

use crate::runner::CONTROL_FD;

/// Inputs to the bash support library prepended to every task script.
#[derive(Debug, Clone)]
pub struct PreambleOptions<'a> {
    pub jq: &'a str,
    pub curl: &'a str,
    pub deps: &'a Value,
    pub dry_run: bool,
    /// Bind-mount target setup when the task runs in a user namespace.
    pub namespace_home: Option<(&'a str, &'a Path)>,
}

/// Renders the runtime support functions. Control commands are written to the control descriptor.
pub fn render_preamble(opts: &PreambleOptions<'_>) -> String {
    let jq = opts.jq;
    let curl = opts.curl;
    let fd = CONTROL_FD;
    let should_apply = if opts.dry_run { "false" } else { "true" };
    let deps = shell_quote(&opts.deps.to_string());
    let namespace_setup = match opts.namespace_home {
        Some((mount, home)) => format!(
            "{mount} --bind {} /root\n",
            shell_quote(&home.to_string_lossy())
        ),
        None => String::new(),
    };

    format!(
        r#"set -e

# reset some variables that might come through from bashrc
export SSH_AUTH_SOCK=""

{namespace_setup}
function taskRunShouldApply {{
  {should_apply}
}}
export -f taskRunShouldApply

function taskSetOutput {{
  {jq} --null-input -cM --arg output "$1" '{{"cmd":"setOutput","output":$output}}' >&{fd}
}}
export -f taskSetOutput

function taskGetDeps {{
  echo {deps}
}}
export -f taskGetDeps

function taskEval {{
  postData="$({jq} -M -n --arg args "$*" '{{"environment":env,"args":$args}}')"
  {curl} -s --unix-socket "$TASK_CONTROL_SOCKET" -X POST -H "Content-Type: text/plain" \
    --data "$postData" http://ctrl/eval
}}
export -f taskEval

function taskReloadFlake {{
  {curl} -s --unix-socket "$TASK_CONTROL_SOCKET" -X POST -H "Content-Type: text/plain" \
    --data "" http://ctrl/reloadFlake
}}
export -f taskReloadFlake

function nixReplEval {{
  {curl} -s --unix-socket "$TASK_CONTROL_SOCKET" -X POST -H "Content-Type: text/plain" \
    --data "$*" http://ctrl/evalRaw
}}
export -f nixReplEval

function taskRunInBackground {{
  {jq} --null-input -cM --arg command "$*" --arg cwd "$PWD" \
    '{{"cmd":"runInBackground","command":$command,"cwd":$cwd,"env":env}}' >&{fd}
}}
export -f taskRunInBackground

function taskRunFinally {{
  {jq} --null-input -cM --arg command "$*" --arg cwd "$PWD" \
    '{{"cmd":"runFinally","command":$command,"cwd":$cwd,"env":env}}' >&{fd}
}}
export -f taskRunFinally

export PATH="$__taskPath"
"#
    )
}

/// Single-quotes `s` for bash.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
