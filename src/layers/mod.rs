pub mod activation;
pub mod aggregate;
pub mod linear;
pub mod mask;
pub mod stability;
