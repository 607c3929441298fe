pub mod chat_list;
pub mod contacts;
pub mod error;
pub mod session;
pub mod settings;

pub use chat_list::{ChatListAggregator, ChatListLabels, ChatListRow};
pub use contacts::ContactDirectory;
pub use error::{ChatError, ChatResult};
pub use session::{ChatClient, ChatSession};
pub use settings::{ChatSettings, SendMode, SettingsError, SettingsStore};
