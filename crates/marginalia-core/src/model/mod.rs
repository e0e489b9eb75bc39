pub mod annotation;
pub mod mutation;
pub mod status;

pub use annotation::{Annotation, AnnotationKind, FetchedAnnotation, Rect};
pub use mutation::{Action, Mutation, NewMutation, Payload};
pub use status::{Status, StatusCatalog};
