//! Command line → closed `Command` enum. Parsed once, at the protocol boundary.

use domshell_core::{Error, Result};

/// Default and maximum depth for `tree`.
pub const DEFAULT_TREE_DEPTH: usize = 2;
pub const MAX_TREE_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpec {
    pub pattern: String,
    pub path: Option<String>,
    /// Only entries with this role (case-insensitive).
    pub role: Option<String>,
    /// Stop once this many matches were collected.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ls { long: bool, path: Option<String> },
    Cd { path: Option<String> },
    Pwd,
    Cat { path: String },
    Text { path: Option<String> },
    Grep(SearchSpec),
    Find(SearchSpec),
    Tree { depth: usize, path: Option<String> },
    Refresh,
    Whoami,
    Env,
    Export { key: String, value: String },
    Unset { key: String },
    Help,
    Navigate { url: String },
    Open { url: String },
    Click { path: String },
    Focus { path: String },
    Type { path: String, text: String },
    Cookies,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command> {
        let tokens = tokenize(line)?;
        let Some((verb, args)) = tokens.split_first() else {
            return Err(Error::MalformedInput("empty command".into()));
        };
        let verb = verb.to_ascii_lowercase();
        let mut args = Args::new(&verb, args);

        let cmd = match verb.as_str() {
            "ls" | "dir" => {
                let long = args.flag(&["-l", "--long"]);
                Command::Ls { long, path: args.optional() }
            }
            "cd" => Command::Cd { path: args.optional() },
            "pwd" => Command::Pwd,
            "cat" => Command::Cat { path: args.required("path")? },
            "text" => Command::Text { path: args.optional() },
            "grep" => {
                let recursive = args.flag(&["-r", "-R", "--recursive"]);
                let spec = args.search()?;
                if recursive {
                    Command::Find(spec)
                } else {
                    Command::Grep(spec)
                }
            }
            "find" => Command::Find(args.search()?),
            "tree" => {
                let depth = match args.option(&["-d", "--depth", "-L"])? {
                    Some(raw) => parse_number(&verb, &raw)?,
                    None => DEFAULT_TREE_DEPTH,
                };
                Command::Tree { depth: depth.clamp(1, MAX_TREE_DEPTH), path: args.optional() }
            }
            "refresh" => Command::Refresh,
            "whoami" => Command::Whoami,
            "env" => Command::Env,
            "export" => {
                let assignment = args.required("KEY=VALUE")?;
                let (key, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| Error::MalformedInput("export: expected KEY=VALUE".into()))?;
                if key.trim().is_empty() {
                    return Err(Error::MalformedInput("export: empty key".into()));
                }
                Command::Export { key: key.trim().to_string(), value: value.to_string() }
            }
            "unset" => Command::Unset { key: args.required("key")? },
            "help" => Command::Help,
            "navigate" | "goto" => Command::Navigate { url: args.required("url")? },
            "open" => Command::Open { url: args.required("url")? },
            "click" => Command::Click { path: args.required("path")? },
            "focus" => Command::Focus { path: args.required("path")? },
            "type" => {
                let path = args.required("path")?;
                let text = args.rest();
                if text.is_empty() {
                    return Err(Error::MalformedInput("type: missing text".into()));
                }
                Command::Type { path, text }
            }
            "cookies" => Command::Cookies,
            other => {
                return Err(Error::MalformedInput(format!("unknown command '{}'", other)));
            }
        };
        args.finish()?;
        Ok(cmd)
    }

    /// Canonical verb; aliases collapse onto it.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Ls { .. } => "ls",
            Command::Cd { .. } => "cd",
            Command::Pwd => "pwd",
            Command::Cat { .. } => "cat",
            Command::Text { .. } => "text",
            Command::Grep(_) => "grep",
            Command::Find(_) => "find",
            Command::Tree { .. } => "tree",
            Command::Refresh => "refresh",
            Command::Whoami => "whoami",
            Command::Env => "env",
            Command::Export { .. } => "export",
            Command::Unset { .. } => "unset",
            Command::Help => "help",
            Command::Navigate { .. } => "navigate",
            Command::Open { .. } => "open",
            Command::Click { .. } => "click",
            Command::Focus { .. } => "focus",
            Command::Type { .. } => "type",
            Command::Cookies => "cookies",
        }
    }

    /// Commands after which the cached snapshot can no longer be trusted.
    pub fn mutates_page(&self) -> bool {
        matches!(
            self,
            Command::Click { .. }
                | Command::Focus { .. }
                | Command::Type { .. }
                | Command::Navigate { .. }
                | Command::Open { .. }
        )
    }
}

pub const HELP: &str = "\
Navigation:
  ls [-l] [path]           list entries (dirs end with /)
  cd [path]                change directory (~, /, .., tabs/<id|match>, windows/<w>/<id>)
  pwd                      print current path
  tree [-d N] [path]       render subtree
Reading:
  cat <path>               entry metadata
  text [path]              rendered text
  grep [-n N] [--type ROLE] <pattern> [path]   search direct children
  find [-n N] [--type ROLE] <pattern> [path]   search recursively (also grep -r)
  whoami                   attached tab url and title
  refresh                  refetch the accessibility tree
Session:
  env | export KEY=VALUE | unset KEY
Page actions:
  click <path> | focus <path> | type <path> <text>
  navigate <url> | open <url>
  cookies
";

/// Cursor over a command's arguments.
struct Args<'a> {
    verb: &'a str,
    rest: Vec<String>,
}

impl<'a> Args<'a> {
    fn new(verb: &'a str, args: &[String]) -> Self {
        Self { verb, rest: args.to_vec() }
    }

    /// Remove a boolean flag wherever it appears.
    fn flag(&mut self, names: &[&str]) -> bool {
        let before = self.rest.len();
        self.rest.retain(|a| !names.contains(&a.as_str()));
        self.rest.len() != before
    }

    /// Remove `--name value` (or `--name=value`) and return the value.
    fn option(&mut self, names: &[&str]) -> Result<Option<String>> {
        for i in 0..self.rest.len() {
            let arg = &self.rest[i];
            if names.contains(&arg.as_str()) {
                if i + 1 >= self.rest.len() {
                    return Err(Error::MalformedInput(format!(
                        "{}: {} needs a value",
                        self.verb, arg
                    )));
                }
                let value = self.rest.remove(i + 1);
                self.rest.remove(i);
                return Ok(Some(value));
            }
            if let Some((name, value)) = arg.split_once('=') {
                if name.starts_with('-') && names.contains(&name) {
                    let value = value.to_string();
                    self.rest.remove(i);
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    fn optional(&mut self) -> Option<String> {
        if self.rest.is_empty() {
            None
        } else {
            Some(self.rest.remove(0))
        }
    }

    fn required(&mut self, what: &str) -> Result<String> {
        self.optional()
            .ok_or_else(|| Error::MalformedInput(format!("{}: missing {}", self.verb, what)))
    }

    fn rest(&mut self) -> String {
        std::mem::take(&mut self.rest).join(" ")
    }

    fn search(&mut self) -> Result<SearchSpec> {
        let limit = match self.option(&["-n", "--limit"])? {
            Some(raw) => match parse_number(self.verb, &raw)? {
                0 => {
                    return Err(Error::MalformedInput(format!(
                        "{}: limit must be at least 1",
                        self.verb
                    )))
                }
                n => Some(n),
            },
            None => None,
        };
        let role = self.option(&["-t", "--type"])?;
        let pattern = self.required("pattern")?;
        Ok(SearchSpec { pattern, path: self.optional(), role, limit })
    }

    fn finish(self) -> Result<()> {
        if let Some(extra) = self.rest.first() {
            return Err(Error::MalformedInput(format!(
                "{}: unexpected argument '{}'",
                self.verb, extra
            )));
        }
        Ok(())
    }
}

fn parse_number(verb: &str, raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .map_err(|_| Error::MalformedInput(format!("{}: '{}' is not a number", verb, raw)))
}

/// Shell-style split: whitespace separated, `'...'` and `"..."` group, `\` escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(next) => {
                    current.push(next);
                    in_token = true;
                }
                None => return Err(Error::MalformedInput("trailing backslash".into())),
            },
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::MalformedInput("unterminated quote".into()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("ls  -l nav").unwrap(), vec!["ls", "-l", "nav"]);
        assert_eq!(
            tokenize(r#"type search_input "hello world""#).unwrap(),
            vec!["type", "search_input", "hello world"]
        );
        assert_eq!(tokenize(r"cd my\ dir").unwrap(), vec!["cd", "my dir"]);
        assert_eq!(tokenize("grep ''").unwrap(), vec!["grep", ""]);
        assert!(tokenize("cat 'oops").is_err());
    }

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(
            Command::parse("ls -l nav").unwrap(),
            Command::Ls { long: true, path: Some("nav".into()) }
        );
        assert_eq!(Command::parse("cd").unwrap(), Command::Cd { path: None });
        assert_eq!(Command::parse("PWD").unwrap(), Command::Pwd);
        assert_eq!(
            Command::parse("goto example.com").unwrap(),
            Command::Navigate { url: "example.com".into() }
        );
        assert_eq!(
            Command::parse("type q_input hello there").unwrap(),
            Command::Type { path: "q_input".into(), text: "hello there".into() }
        );
    }

    #[test]
    fn test_parse_search() {
        let cmd = Command::parse("grep -r --type link -n 3 docs main").unwrap();
        assert_eq!(
            cmd,
            Command::Find(SearchSpec {
                pattern: "docs".into(),
                path: Some("main".into()),
                role: Some("link".into()),
                limit: Some(3),
            })
        );
        assert_eq!(cmd.verb(), "find");
        assert!(matches!(Command::parse("grep login").unwrap(), Command::Grep(_)));
    }

    #[test]
    fn test_parse_tree_depth_is_clamped() {
        assert_eq!(
            Command::parse("tree -d 50").unwrap(),
            Command::Tree { depth: MAX_TREE_DEPTH, path: None }
        );
        assert_eq!(
            Command::parse("tree main").unwrap(),
            Command::Tree { depth: DEFAULT_TREE_DEPTH, path: Some("main".into()) }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Command::parse(""), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("rm -rf /"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("cat"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("pwd extra"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("export NOEQUALS"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("find -n many x"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("find -n 0 x"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("grep -n 0 x"), Err(Error::MalformedInput(_))));
        assert!(matches!(Command::parse("type field"), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_mutating_commands() {
        assert!(Command::parse("click submit_btn").unwrap().mutates_page());
        assert!(!Command::parse("ls").unwrap().mutates_page());
    }
}
