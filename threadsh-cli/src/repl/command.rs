//! Shell line parsing
//!
//! A line is a command word followed by its argument text. Dotted words
//! address the active database (`db.<collection>.<op>`) or the open
//! transaction (`tx.<op>`). A trailing `()` on the command word is accepted
//! so `show()` and `db.getLinks()` read the same as `show` and `db.getLinks`.
//!
//! Supported commands:
//! - `auth [token]` - Connect (cloud when a token is given)
//! - `use <name> [id]` - Activate a store, creating or resuming it
//! - `show` - List registered stores
//! - `store` - Print the active store
//! - `db.createCollection <name> <schema>` - Register a collection
//! - `db.getLinks` - Print the active store's links
//! - `db.<collection>.<op> <json>` - Collection operations
//! - `tx.<op> <json>` / `tx.end` - Open transaction operations
//! - `playground` - Print the fixtures usable as `@name`
//! - `help` / `exit`

use super::playground;

/// Operations available on `db.<collection>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOp {
    Create,
    Save,
    Delete,
    Has,
    Find,
    Get,
    Listen,
    ReadTransaction,
    WriteTransaction,
}

impl CollectionOp {
    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "create" => Self::Create,
            "save" => Self::Save,
            "delete" => Self::Delete,
            "has" => Self::Has,
            "find" => Self::Find,
            "get" => Self::Get,
            "listen" => Self::Listen,
            "readTransaction" => Self::ReadTransaction,
            "writeTransaction" => Self::WriteTransaction,
            _ => return None,
        })
    }

    /// Whether the operation needs argument text
    fn takes_argument(self) -> bool {
        !matches!(self, Self::ReadTransaction | Self::WriteTransaction)
    }
}

/// Operations available on `tx`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Create,
    Save,
    Delete,
    Has,
    Find,
    Get,
}

impl TxOp {
    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "create" => Self::Create,
            "save" => Self::Save,
            "delete" => Self::Delete,
            "has" => Self::Has,
            "find" => Self::Find,
            "get" | "findById" => Self::Get,
            _ => return None,
        })
    }
}

/// A parsed shell line
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Auth { token: Option<String> },
    Use { name: String, id: Option<String> },
    Show,
    Store,
    CreateCollection { name: String, schema: String },
    GetLinks,
    Collection {
        collection: String,
        op: CollectionOp,
        arg: String,
    },
    Transaction { op: TxOp, arg: String },
    EndTransaction,
    Playground,
    Help,
    Exit,
    /// Blank line
    Empty,
    /// Known command with missing or malformed arguments
    Usage(&'static str),
    Unknown { cmd: String },
}

/// Parse one input line
pub fn parse_line(input: &str) -> Command {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Command::Empty;
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    let head = head.strip_suffix("()").unwrap_or(head);

    match head {
        "auth" => Command::Auth {
            token: words(rest).into_iter().next(),
        },
        "use" => {
            let mut args = words(rest).into_iter();
            match args.next() {
                Some(name) => Command::Use {
                    name,
                    id: args.next(),
                },
                None => Command::Usage("use <name> [id]"),
            }
        }
        "show" => Command::Show,
        "store" => Command::Store,
        "playground" => Command::Playground,
        "help" | "?" => Command::Help,
        "exit" | "quit" | ".exit" => Command::Exit,
        _ => {
            if let Some(path) = head.strip_prefix("db.") {
                parse_db(path, rest, head)
            } else if head == "tx.end" {
                Command::EndTransaction
            } else if let Some(op) = head.strip_prefix("tx.") {
                match TxOp::parse(op) {
                    Some(_) if rest.is_empty() => Command::Usage("tx.<op> <json>"),
                    Some(op) => Command::Transaction {
                        op,
                        arg: rest.to_string(),
                    },
                    None => Command::Unknown {
                        cmd: head.to_string(),
                    },
                }
            } else {
                Command::Unknown {
                    cmd: head.to_string(),
                }
            }
        }
    }
}

fn parse_db(path: &str, rest: &str, head: &str) -> Command {
    match path {
        "createCollection" => match rest.split_once(char::is_whitespace) {
            Some((name, schema)) if !schema.trim().is_empty() => Command::CreateCollection {
                name: playground::resolve_name(name),
                schema: schema.trim().to_string(),
            },
            _ => Command::Usage("db.createCollection <name> <schema>"),
        },
        "getLinks" => Command::GetLinks,
        _ => {
            let Some((collection, op)) = path.rsplit_once('.') else {
                return Command::Unknown {
                    cmd: head.to_string(),
                };
            };
            match CollectionOp::parse(op) {
                Some(op) if op.takes_argument() && rest.is_empty() => {
                    Command::Usage("db.<collection>.<op> <json>")
                }
                Some(op) => Command::Collection {
                    collection: playground::resolve_name(collection),
                    op,
                    arg: rest.to_string(),
                },
                None => Command::Unknown {
                    cmd: head.to_string(),
                },
            }
        }
    }
}

/// Shell-style words, falling back to whitespace splitting on bad quoting
fn words(rest: &str) -> Vec<String> {
    shlex::split(rest)
        .unwrap_or_else(|| rest.split_whitespace().map(str::to_string).collect())
}

/// Help text for the `help` command
pub fn help_text() -> &'static str {
    r#"Connection:
  auth [token]                          Connect to the local daemon, or to the cloud with a token
  use <name> [id]                       Use a store by name, creating it (or resuming id) if needed
  show                                  List registered stores (* marks the active one)
  store                                 Print the active store

Database (the active store):
  db.createCollection <name> <schema>   Register a schema and bind db.<name>
  db.getLinks                           Print the store's links

Collections:
  db.<c>.create <entities>              Create new entities
  db.<c>.save <entities>                Save changes to existing entities
  db.<c>.delete <ids>                   Delete entities by id
  db.<c>.has <ids>                      True if every entity exists
  db.<c>.find <query>                   Find entities ({"field": value} filter)
  db.<c>.get <id>                       Get one entity by id
  db.<c>.listen <id>                    Print updates to an entity as they happen
  db.<c>.readTransaction                Open a read-only transaction as tx
  db.<c>.writeTransaction               Open a write transaction as tx

Transactions:
  tx.create|save|delete|has|find|get <json>
  tx.end                                Commit and close the open transaction

Utility:
  playground                            Show fixtures usable as @model @schema @adam @eve @query
  help                                  Show this help
  exit                                  Leave the shell

Arguments are JSON; @name fixtures expand anywhere, e.g. db.Person.create [@adam, @eve]"#
}
