use uuid::Uuid;

/// Opaque, already-authenticated user identifier supplied by the identity layer.
pub type UserId = String;

/// Opaque card reference from the card catalog.
pub type CardId = String;

pub type RoomId = Uuid;
pub type GameId = Uuid;
pub type RoundId = Uuid;
pub type ChoiceId = Uuid;
