use core::fmt::{self, Display, Formatter};

use mailforge_common::status::Status;

use crate::command::Command;

/// Per-connection protocol state.
///
/// `Greeting` exists only until the banner is written; the command loop then
/// runs between `WaitHelo` and `Closing`. `InData` and `InAuth` are occupied
/// while the corresponding sub-protocol owns the stream, which is what makes
/// DATA and AUTH natural pipeline barriers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Greeting,
    WaitHelo,
    Idle,
    InMail,
    InRcpt,
    InData,
    InAuth,
    Closing,
    Closed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Greeting => "Greeting",
            Self::WaitHelo => "WaitHelo",
            Self::Idle => "Idle",
            Self::InMail => "InMail",
            Self::InRcpt => "InRcpt",
            Self::InData => "InData",
            Self::InAuth => "InAuth",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        })
    }
}

impl State {
    /// Validate a command against the current state and yield the state the
    /// session moves to when the command's handler succeeds.
    ///
    /// This checks ordering only; handlers still apply policy (filters,
    /// caps, TLS/auth preconditions) and may veto the transition, in which
    /// case the session keeps its current state.
    pub fn transition(self, command: &Command) -> Result<Self, Status> {
        match (self, command) {
            // RSET, NOOP, QUIT, HELP, VRFY and EXPN are legal everywhere the
            // command loop runs.
            (state, Command::Rset) => Ok(if state == Self::WaitHelo {
                Self::WaitHelo
            } else {
                Self::Idle
            }),
            (state, Command::Noop | Command::Help | Command::Vrfy(_) | Command::Expn(_)) => {
                Ok(state)
            }
            (_, Command::Quit) => Ok(Self::Closing),

            // A fresh EHLO/HELO resets any transaction in progress.
            (_, Command::Ehlo(_) | Command::Helo(_)) => Ok(Self::Idle),

            (Self::Idle, Command::StartTls) => Ok(Self::WaitHelo),
            (_, Command::StartTls) => Err(Status::InvalidCommandSequence),

            (Self::Idle, Command::Auth { .. }) => Ok(Self::Idle),
            (_, Command::Auth { .. }) => Err(Status::InvalidCommandSequence),

            (Self::Idle, Command::MailFrom { .. }) => Ok(Self::InMail),
            (_, Command::MailFrom { .. }) => Err(Status::InvalidCommandSequence),

            (Self::InMail | Self::InRcpt, Command::RcptTo { .. }) => Ok(Self::InRcpt),
            (_, Command::RcptTo { .. }) => Err(Status::InvalidCommandSequence),

            (Self::InRcpt, Command::Data) => Ok(Self::InData),
            (_, Command::Data) => Err(Status::InvalidCommandSequence),

            // BDAT is legal once the envelope has a recipient; successive
            // chunks stay in InRcpt until LAST completes the message.
            (Self::InRcpt, Command::Bdat { .. }) => Ok(Self::InRcpt),
            (_, Command::Bdat { .. }) => Err(Status::InvalidCommandSequence),
        }
    }

    /// Whether a mail transaction is open (between MAIL FROM and the end of
    /// DATA).
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(self, Self::InMail | Self::InRcpt | Self::InData)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}
