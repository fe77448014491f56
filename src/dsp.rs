pub mod echo;
pub mod lms;
pub mod noise;

pub use echo::EchoCanceller;
pub use lms::LmsFilter;
pub use noise::NoiseReducer;
