/**
 * GPU-side resources: the pick encodings shared with the shaders and the wgpu
 * implementation of the backend contract.
 */
pub mod pick;
pub mod wgpu_backend;
