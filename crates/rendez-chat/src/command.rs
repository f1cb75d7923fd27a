//! Parsing of `/command` input lines.

/// A command line, parsed after its prefix character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the options.
    Opt,
    /// Apply dynamic options from a JSON object.
    Set(String),
    /// Roll the oldest N lines out of the context.
    Forget(usize),
    /// Print the first N rolling lines.
    Head(usize),
    /// Print the last N rolling lines.
    Tail(usize),
    /// Erase N trailing tokens.
    Back(usize),
    /// Drop the current turn's content and generate it again.
    Regen,
    /// Drop the last N turns.
    Delete(usize),
    /// Append a line without generating.
    Puts(String),
    /// Seed a line for the model to finish, optionally capped at N bytes.
    Gets { byte_limit: usize, text: String },
    /// End the turn, optionally opening the next with literal text.
    Yield(String),
    /// Recognized keyword with unusable arguments.
    Invalid(String),
    Unknown(String),
}

const DELIMS: &[char] = &[':', '=', '!', ' '];
const DEFAULT_LINE_COUNT: usize = 10;

/// Parse a command line with its prefix character already stripped.
pub fn parse_command(line: &str) -> Command {
    let (keyword, rest) = split_keyword(line);
    match keyword {
        "opt" => Command::Opt,
        "set" => Command::Set(rest.to_string()),
        "forget" | "rollforget" => match parse_count(rest) {
            Some(Some(n)) => Command::Forget(n),
            _ => Command::Invalid("Ignoring /forget command without line count.".to_string()),
        },
        "head" => count_or_default(rest, DEFAULT_LINE_COUNT, Command::Head, "head"),
        "tail" => count_or_default(rest, DEFAULT_LINE_COUNT, Command::Tail, "tail"),
        "back" => count_or_default(rest, 1, Command::Back, "back"),
        "delete" => count_or_default(rest, 1, Command::Delete, "delete"),
        "regen" => Command::Regen,
        "puts" => Command::Puts(rest.to_string()),
        "gets" => {
            let (count, text) = split_leading_count(rest);
            Command::Gets {
                byte_limit: count.unwrap_or(0),
                text: text.trim_start_matches(' ').to_string(),
            }
        }
        "yield" => Command::Yield(rest.to_string()),
        _ => Command::Unknown(line.to_string()),
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.strip_prefix(DELIMS).unwrap_or(rest);
    (keyword, rest)
}

/// `None` for no argument, `Some(None)` for an unparsable one.
fn parse_count(rest: &str) -> Option<Option<usize>> {
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some(rest.parse::<usize>().ok().filter(|&n| n > 0))
}

fn count_or_default(
    rest: &str,
    default: usize,
    make: fn(usize) -> Command,
    keyword: &str,
) -> Command {
    match parse_count(rest) {
        None => make(default),
        Some(Some(n)) => make(n),
        Some(None) => Command::Invalid(format!("Ignoring /{keyword} with bad count: {rest}")),
    }
}

fn split_leading_count(rest: &str) -> (Option<usize>, &str) {
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let count = rest[..digits].parse::<usize>().ok().filter(|&n| n > 0);
    (count, &rest[digits..])
}
