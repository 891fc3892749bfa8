/// System label ids mirrored from the provider
pub const INBOX: &str = "INBOX";
pub const SENT: &str = "SENT";
pub const SPAM: &str = "SPAM";
pub const TRASH: &str = "TRASH";
pub const DRAFT: &str = "DRAFT";
pub const STARRED: &str = "STARRED";
pub const IMPORTANT: &str = "IMPORTANT";

/// How a folder name narrows a thread listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderFilter {
    /// Threads carrying this label
    Label(String),
    /// Threads carrying none of these labels
    Excluding(Vec<String>),
}

impl FolderFilter {
    pub fn from_folder(folder: &str) -> Self {
        match folder.trim().to_lowercase().as_str() {
            "inbox" => Self::Label(INBOX.into()),
            "sent" => Self::Label(SENT.into()),
            "spam" => Self::Label(SPAM.into()),
            "trash" | "bin" => Self::Label(TRASH.into()),
            "draft" | "drafts" => Self::Label(DRAFT.into()),
            "starred" => Self::Label(STARRED.into()),
            "important" => Self::Label(IMPORTANT.into()),
            "archive" => Self::Excluding(vec![INBOX.into(), SPAM.into(), TRASH.into()]),
            _ => Self::Label(folder.trim().to_string()),
        }
    }
}
