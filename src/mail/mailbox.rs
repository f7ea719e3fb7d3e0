//! Mailbox references and well-known folder names.

use std::fmt;

/// Which mailbox a call addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Mailbox {
    /// The signed-in user; only meaningful for the delegated flow.
    #[default]
    Me,
    /// Any mailbox by address or object id.
    User(String),
}

impl Mailbox {
    /// `None` or a blank address means [`Mailbox::Me`].
    pub fn from_address(address: Option<&str>) -> Self {
        match address.map(str::trim) {
            Some(address) if !address.is_empty() => Self::User(address.to_string()),
            _ => Self::Me,
        }
    }

    /// Leading path segments for this mailbox.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Me => vec!["me"],
            Self::User(address) => vec!["users", address.as_str()],
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Me => write!(f, "me"),
            Self::User(address) => write!(f, "users/{}", address),
        }
    }
}

/// Folder names Graph resolves in any mailbox without an id lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownFolder {
    Archive,
    Clutter,
    Conflicts,
    ConversationHistory,
    DeletedItems,
    Drafts,
    Inbox,
    JunkEmail,
    LocalFailures,
    MsgFolderRoot,
    Outbox,
    RecoverableItemsDeletions,
    Scheduled,
    SearchFolders,
    SentItems,
    ServerFailures,
    SyncIssues,
}

impl WellKnownFolder {
    pub const ALL: [WellKnownFolder; 17] = [
        Self::Archive,
        Self::Clutter,
        Self::Conflicts,
        Self::ConversationHistory,
        Self::DeletedItems,
        Self::Drafts,
        Self::Inbox,
        Self::JunkEmail,
        Self::LocalFailures,
        Self::MsgFolderRoot,
        Self::Outbox,
        Self::RecoverableItemsDeletions,
        Self::Scheduled,
        Self::SearchFolders,
        Self::SentItems,
        Self::ServerFailures,
        Self::SyncIssues,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Clutter => "clutter",
            Self::Conflicts => "conflicts",
            Self::ConversationHistory => "conversationhistory",
            Self::DeletedItems => "deleteditems",
            Self::Drafts => "drafts",
            Self::Inbox => "inbox",
            Self::JunkEmail => "junkemail",
            Self::LocalFailures => "localfailures",
            Self::MsgFolderRoot => "msgfolderroot",
            Self::Outbox => "outbox",
            Self::RecoverableItemsDeletions => "recoverableitemsdeletions",
            Self::Scheduled => "scheduled",
            Self::SearchFolders => "searchfolders",
            Self::SentItems => "sentitems",
            Self::ServerFailures => "serverfailures",
            Self::SyncIssues => "syncissues",
        }
    }

    /// Case-insensitive lookup by Graph name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|folder| folder.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for WellKnownFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for WellKnownFolder {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
