pub mod communication;
pub mod reference;

pub use communication::{
    Attachment, CodeableConcept, Communication, CommunicationStatus, Extension, Meta, Payload,
};
pub use reference::{Profile, ProfileKind, Reference};
