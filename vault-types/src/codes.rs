//! Response codes.
//!
//! Codes are short strings `"<class>:<tag>"`. The class digit tells a client
//! how to react without knowing the tag.

/// The class of a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeClass {
    /// `0:*` - more to come or try again
    Intermediary,
    /// `1:*` - operation completed
    Success,
    /// `2:*` - the request was at fault
    ClientFault,
    /// `3:*` - the server was at fault
    ServerFault,
}

macro_rules! response_codes {
    ($( $(#[$doc:meta])* $variant:ident => $code:literal ),+ $(,)?) => {
        /// Every response code the server emits.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResponseCode {
            $( $(#[$doc])* $variant, )+
        }

        impl ResponseCode {
            /// Every code, in declaration order.
            pub const ALL: &'static [ResponseCode] = &[$( ResponseCode::$variant, )+];

            /// Wire representation.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( ResponseCode::$variant => $code, )+
                }
            }

            /// Parse a wire code.
            pub fn parse(code: &str) -> Option<Self> {
                match code {
                    $( $code => Some(ResponseCode::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

response_codes! {
    /// Acknowledged, continue
    Ack => "0:a",
    /// Partial read, more data remains
    PartialRead => "0:r",
    /// Wait and retry
    Wait => "0:wait",
    /// Retry the request
    Retry => "0:retry",

    /// Heartbeat answered
    Heartbeat => "1:hb",
    /// Goodbye acknowledged
    Bye => "1:bye",
    /// Query answered
    Answer => "1:ans",
    /// User created
    UserCreated => "1:unew",
    /// Authenticated
    Authenticated => "1:auth",
    /// Session refreshed
    Refreshed => "1:ref",
    /// Password changed
    PasswordChanged => "1:pw",
    /// User deleted
    UserDeleted => "1:udel",
    /// Session terminated
    SessionTerminated => "1:sterm",
    /// File created
    FileCreated => "1:fnew",
    /// File read to the end
    FileRead => "1:read",
    /// File amended
    FileAmended => "1:amnd",
    /// File deleted
    FileDeleted => "1:fdel",
    /// Ownership transferred
    Transferred => "1:sft",
    /// Grant recorded
    Granted => "1:gnt",
    /// Grant revoked
    Revoked => "1:rvk",
    /// File made public
    Publicised => "1:pub",
    /// File made private
    Hidden => "1:hide",
    /// Trust rotation accepted
    Rotated => "1:rot",

    /// Malformed header
    MalformedHeader => "2:malf",
    /// Truncated body
    TruncatedBody => "2:trnc",
    /// Schema violation
    SchemaViolation => "2:schm",
    /// Unknown operation
    UnknownOperation => "2:unop",
    /// Rate limit exceeded
    RateLimited => "2:rlex",
    /// Invalid credentials
    InvalidCredentials => "2:auth",
    /// No such user
    UserNotFound => "2:nouser",
    /// User is banned
    Banned => "2:ban",
    /// Token expired
    TokenExpired => "2:exp",
    /// Token unknown
    TokenUnknown => "2:tok",
    /// Superseded token reused; session terminated
    ReplayDetected => "2:rply",
    /// Refresh digest invalid
    RefreshInvalid => "2:rinv",
    /// Superseded refresh digest reused; session terminated
    RefreshReplay => "2:rrpl",
    /// Refresh attempted before the not-before window
    RefreshTooEarly => "2:early",
    /// Resource already exists
    AlreadyExists => "2:dup",
    /// Insufficient permission
    InsufficientPermission => "2:perm",
    /// File not found
    FileNotFound => "2:nf",
    /// Operation conflicts with current state
    OperationalConflict => "2:opcf",
    /// File state conflict
    FileConflict => "2:fcnt",
    /// Storage quota exceeded
    QuotaExceeded => "2:quota",
    /// File count limit exceeded
    FileLimitExceeded => "2:fmax",
    /// File is being amended by someone else
    FileBusy => "2:busy",
    /// No session to act on
    NoSession => "2:nsess",
    /// Peer certificate not trusted
    TrustMismatch => "2:trust",
    /// New password equals the current one
    PasswordUnchanged => "2:same",
    /// Other client fault
    ClientFault => "2:?",

    /// Connection pool exhausted
    PoolExhausted => "3:pool",
    /// Internal timeout
    Timeout => "3:t",
    /// Database lease expired mid-operation
    LeaseExpired => "3:lease",
    /// Backing store failure
    Database => "3:db",
    /// Disk I/O failure
    Disk => "3:disk",
    /// Other internal failure
    Internal => "3:?",
}

impl ResponseCode {
    /// Class of this code.
    pub fn class(self) -> CodeClass {
        match self.as_str().as_bytes()[0] {
            b'0' => CodeClass::Intermediary,
            b'1' => CodeClass::Success,
            b'2' => CodeClass::ClientFault,
            _ => CodeClass::ServerFault,
        }
    }

    /// Whether this code reports a failure.
    pub fn is_fault(self) -> bool {
        matches!(self.class(), CodeClass::ClientFault | CodeClass::ServerFault)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
