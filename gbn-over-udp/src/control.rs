//! Runtime control of the forced rules.
//!
//! [`ControlPlane`] is a cheap cloneable handle onto the router's forward
//! state.  Mutations take the same lock the forward loop takes, so a rule
//! change lands between two datagrams and never halfway through one.
//!
//! An operator console ([`run_console`]) accepts one command per line:
//!
//! ```text
//! add <kind> <list>      add sequence numbers to a rule
//! remove <kind> <list>   remove sequence numbers from a rule
//! set <kind> <list>      replace a rule
//! clear [<kind>]         empty one rule, or all of them
//! show                   print the rules
//! help                   print this summary
//! exit | quit            leave the console
//! ```
//!
//! `<kind>` is one of `drop`, `corrupt`, `dup`, `reorder`; `<list>` uses the
//! range syntax of [`crate::rules::parse_seq_list`], e.g. `2,5-7`.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::ForwardState;
use crate::rules::{parse_seq_list, ForcedRules, ImpairmentKind, RuleError};

pub const HELP: &str = "\
commands:
  add <kind> <list>      add sequence numbers to a rule
  remove <kind> <list>   remove sequence numbers from a rule
  set <kind> <list>      replace a rule
  clear [<kind>]         empty one rule, or all of them
  show                   print the rules
  exit | quit            leave the console
kinds: drop, corrupt, dup, reorder    lists: 2,5-7";

/// Handle for inspecting and changing forced rules while the router runs.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    state: Arc<Mutex<ForwardState>>,
}

impl ControlPlane {
    pub fn new(state: Arc<Mutex<ForwardState>>) -> Self {
        Self { state }
    }

    pub fn add(&self, kind: ImpairmentKind, list: &str) -> Result<(), RuleError> {
        let seqs = parse_seq_list(list)?;
        self.state.lock().rules.add(kind, &seqs);
        log::info!("[control] add {kind} {list}");
        Ok(())
    }

    pub fn remove(&self, kind: ImpairmentKind, list: &str) -> Result<(), RuleError> {
        let seqs = parse_seq_list(list)?;
        self.state.lock().rules.remove(kind, &seqs);
        log::info!("[control] remove {kind} {list}");
        Ok(())
    }

    pub fn set(&self, kind: ImpairmentKind, list: &str) -> Result<(), RuleError> {
        let seqs = parse_seq_list(list)?;
        self.state.lock().rules.set(kind, seqs);
        log::info!("[control] set {kind} {list}");
        Ok(())
    }

    /// Empty one rule, or every rule when `kind` is `None`.
    pub fn clear(&self, kind: Option<ImpairmentKind>) {
        let mut state = self.state.lock();
        match kind {
            Some(kind) => {
                state.rules.clear(kind);
                log::info!("[control] clear {kind}");
            }
            None => {
                state.rules.clear_all();
                log::info!("[control] clear all");
            }
        }
    }

    /// Snapshot of the current rules.
    pub fn list(&self) -> ForcedRules {
        self.state.lock().rules.clone()
    }

    pub fn apply(&self, command: &Command) -> Reply {
        log::debug!("[control] {command:?}");
        match command {
            Command::Add(kind, seqs) => self.state.lock().rules.add(*kind, seqs),
            Command::Remove(kind, seqs) => self.state.lock().rules.remove(*kind, seqs),
            Command::Set(kind, seqs) => self.state.lock().rules.set(*kind, seqs.clone()),
            Command::Clear(kind) => self.clear(*kind),
            Command::Show => {}
            Command::Help => return Reply::Text(HELP.to_string()),
            Command::Exit => return Reply::Exit,
        }
        Reply::Text(self.list().to_string())
    }
}

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(ImpairmentKind, BTreeSet<u16>),
    Remove(ImpairmentKind, BTreeSet<u16>),
    Set(ImpairmentKind, BTreeSet<u16>),
    Clear(Option<ImpairmentKind>),
    Show,
    Help,
    Exit,
}

/// Result of applying a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?} (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl Command {
    /// Parse one line; blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();
        let verb = verb.to_ascii_lowercase();
        let command = match verb.as_str() {
            "add" | "remove" | "set" => {
                let usage = match verb.as_str() {
                    "add" => "add <kind> <list>",
                    "remove" => "remove <kind> <list>",
                    _ => "set <kind> <list>",
                };
                let [kind, list @ ..] = rest.as_slice() else {
                    return Err(CommandError::Usage(usage));
                };
                if list.is_empty() {
                    return Err(CommandError::Usage(usage));
                }
                let kind: ImpairmentKind = kind.parse()?;
                // Lists may contain spaces: "add drop 1, 3-4".
                let seqs = parse_seq_list(&list.concat())?;
                match verb.as_str() {
                    "add" => Command::Add(kind, seqs),
                    "remove" => Command::Remove(kind, seqs),
                    _ => Command::Set(kind, seqs),
                }
            }
            "clear" => match rest.as_slice() {
                [] | ["all"] => Command::Clear(None),
                [kind] => Command::Clear(Some(kind.parse()?)),
                _ => return Err(CommandError::Usage("clear [<kind>]")),
            },
            "show" | "list" => Command::Show,
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

/// Read commands from `input` until `exit`/`quit` or end of input, writing
/// each reply to `output`.
pub async fn run_console<R, W>(
    control: ControlPlane,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => control.apply(&command),
            Err(e) => Reply::Text(format!("error: {e}")),
        };
        match reply {
            Reply::Text(text) => {
                output.write_all(text.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            Reply::Exit => break,
        }
    }
    log::info!("[control] console closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> ControlPlane {
        ControlPlane::new(Arc::new(Mutex::new(ForwardState::default())))
    }

    fn set(items: &[u16]) -> BTreeSet<u16> {
        items.iter().copied().collect()
    }

    #[test]
    fn operations_mutate_the_shared_rules() {
        let control = plane();
        control.add(ImpairmentKind::Drop, "1-3").unwrap();
        control.remove(ImpairmentKind::Drop, "2").unwrap();
        control.set(ImpairmentKind::Reorder, "9").unwrap();
        let rules = control.list();
        assert_eq!(rules.drop, set(&[1, 3]));
        assert_eq!(rules.reorder, set(&[9]));

        control.clear(Some(ImpairmentKind::Drop));
        assert!(control.list().drop.is_empty());
        control.clear(None);
        assert!(control.list().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let a = plane();
        let b = a.clone();
        a.add(ImpairmentKind::Corrupt, "4").unwrap();
        assert!(b.list().contains(ImpairmentKind::Corrupt, 4));
    }

    #[test]
    fn bad_list_leaves_rules_untouched() {
        let control = plane();
        control.add(ImpairmentKind::Drop, "1").unwrap();
        assert!(control.set(ImpairmentKind::Drop, "x").is_err());
        assert_eq!(control.list().drop, set(&[1]));
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("add drop 2,5-7"),
            Ok(Some(Command::Add(ImpairmentKind::Drop, set(&[2, 5, 6, 7]))))
        );
        assert_eq!(
            Command::parse("remove dup 1, 3"),
            Ok(Some(Command::Remove(ImpairmentKind::Duplicate, set(&[1, 3]))))
        );
        assert_eq!(
            Command::parse("SET reorder 4"),
            Ok(Some(Command::Set(ImpairmentKind::Reorder, set(&[4]))))
        );
        assert_eq!(Command::parse("clear"), Ok(Some(Command::Clear(None))));
        assert_eq!(
            Command::parse("clear corrupt"),
            Ok(Some(Command::Clear(Some(ImpairmentKind::Corrupt))))
        );
        assert_eq!(Command::parse("show"), Ok(Some(Command::Show)));
        assert_eq!(Command::parse("quit"), Ok(Some(Command::Exit)));
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            Command::parse("add drop"),
            Err(CommandError::Usage("add <kind> <list>"))
        );
        assert!(matches!(
            Command::parse("add lose 1"),
            Err(CommandError::Rule(RuleError::UnknownKind(_)))
        ));
        assert!(matches!(
            Command::parse("frobnicate"),
            Err(CommandError::Unknown(_))
        ));
        assert!(Command::parse("clear drop dup").is_err());
    }

    #[tokio::test]
    async fn console_applies_commands_until_exit() {
        let control = plane();
        let input: &[u8] = b"add drop 2\nbogus\nset corrupt 1-2\nexit\nadd drop 9\n";
        let mut output = Vec::new();
        run_console(control.clone(), input, &mut output).await.unwrap();

        let rules = control.list();
        assert_eq!(rules.drop, set(&[2]));
        assert_eq!(rules.corrupt, set(&[1, 2]));

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "drop=[2] corrupt=[] dup=[] reorder=[]");
        assert!(lines[1].starts_with("error: unknown command"));
        assert_eq!(lines[2], "drop=[2] corrupt=[1-2] dup=[] reorder=[]");
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn console_stops_at_end_of_input() {
        let control = plane();
        let input: &[u8] = b"add reorder 3";
        let mut output = Vec::new();
        run_console(control.clone(), input, &mut output).await.unwrap();
        assert!(control.list().contains(ImpairmentKind::Reorder, 3));
    }
}
