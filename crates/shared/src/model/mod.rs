//! Row types exchanged with the persistence boundary.

pub mod connection;
pub mod conversation;
pub mod keys;
pub mod message;

pub use connection::{Connection, ConnectionStatus, Profile};
pub use conversation::{
    Conversation, ConversationMember, GroupKeyRecord, KeyStatus, MemberRole,
};
pub use keys::{NewKeyRecord, UserEncryptionKeyRecord};
pub use message::{DecryptedMessage, Message, MessagePage, NewMessage};
