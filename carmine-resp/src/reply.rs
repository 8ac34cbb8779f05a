//! Canonical reply model and its RESP encoding.
//!
//! The enum stays protocol-neutral so command logic never formats bytes;
//! encoding to the wire happens in one place (`Reply::to_bytes`). Null
//! bulk (`$-1`) and null array (`*-1`) are distinct variants because the
//! protocol distinguishes them from empty replies.

/// One request or reply argv: a vector of binary-safe arguments.
pub type CmdLine = Vec<Vec<u8>>;

/// Canonical reply representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>` status line.
    Status(String),
    /// `-<text>` error line; the text carries its own code prefix.
    Error(String),
    /// `:<n>` integer.
    Integer(i64),
    /// `$<len>` binary-safe bulk string.
    Bulk(Vec<u8>),
    /// `$-1` null bulk string.
    NullBulk,
    /// `*<n>` array of replies.
    Array(Vec<Reply>),
    /// `*-1` null array, used by `EXEC` aborts on watched-key changes.
    NullArray,
}

impl Reply {
    /// `+OK` reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::Status("OK".to_owned())
    }

    /// `+PONG` reply.
    #[must_use]
    pub fn pong() -> Self {
        Self::Status("PONG".to_owned())
    }

    /// `+QUEUED` reply, sent for commands buffered inside `MULTI`.
    #[must_use]
    pub fn queued() -> Self {
        Self::Status("QUEUED".to_owned())
    }

    /// Generic `ERR`-coded error reply.
    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self::Error(format!("ERR {}", message.into()))
    }

    /// Error reply for a command applied to the wrong entity kind.
    #[must_use]
    pub fn wrong_type_err() -> Self {
        Self::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_owned())
    }

    /// Error reply for a wrong argument count.
    #[must_use]
    pub fn arg_num_err(command: &str) -> Self {
        Self::err(format!(
            "wrong number of arguments for '{}' command",
            command.to_lowercase()
        ))
    }

    /// Error reply for an unrecognised command name.
    #[must_use]
    pub fn unknown_command_err(command: &str) -> Self {
        Self::err(format!("unknown command '{}'", command.to_lowercase()))
    }

    /// Error reply for non-integer arguments.
    #[must_use]
    pub fn not_integer_err() -> Self {
        Self::err("value is not an integer or out of range")
    }

    /// Error reply for non-float arguments.
    #[must_use]
    pub fn not_float_err() -> Self {
        Self::err("value is not a valid float")
    }

    /// Error reply for syntactically invalid option tokens.
    #[must_use]
    pub fn syntax_err() -> Self {
        Self::err("syntax error")
    }

    /// Fallback reply for caught dispatch panics.
    #[must_use]
    pub fn unknown_err() -> Self {
        Self::err("unknown error")
    }

    /// Wraps an argv vector as an array of bulk strings.
    #[must_use]
    pub fn multi_bulk(args: CmdLine) -> Self {
        Self::Array(args.into_iter().map(Reply::Bulk).collect())
    }

    /// Returns whether this reply is an error line.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Encodes the reply into RESP bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Status(text) => {
                let mut out = Vec::with_capacity(text.len() + 3);
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
                out
            }
            Self::Error(text) => {
                let mut out = Vec::with_capacity(text.len() + 3);
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
                out
            }
            Self::Integer(value) => format!(":{value}\r\n").into_bytes(),
            Self::Bulk(payload) => {
                let mut out = format!("${}\r\n", payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out.extend_from_slice(b"\r\n");
                out
            }
            Self::NullBulk => b"$-1\r\n".to_vec(),
            Self::Array(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend_from_slice(&item.to_bytes());
                }
                out
            }
            Self::NullArray => b"*-1\r\n".to_vec(),
        }
    }
}
