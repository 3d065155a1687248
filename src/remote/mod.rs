pub mod http;
pub mod traits;
pub mod types;

pub use http::HttpRemote;
pub use traits::RemoteApi;
pub use types::{
    BatchItem, ConversationPage, RemoteConversation, RemoteConversationDetail, RemoteError,
    RemoteMessage,
};
