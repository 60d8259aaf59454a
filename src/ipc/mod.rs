//! Descriptor passing between the engine and a frameserver.
//!
//! Shared memory cannot carry kernel object references, so buffer handles,
//! render nodes and sub-segment sockets travel over an auxiliary Unix
//! socket as `SCM_RIGHTS` messages. The child end of the socket is placed
//! at [`CONTROL_FD`] and named by `FRAMELINK_SOCKIN_FD`.
//!
//! A transfer is always announced with a
//! [`TargetEvent::DescriptorTransfer`](crate::event::TargetEvent) event so the
//! child knows a descriptor is waiting and what it is.

mod channel;
mod scm;

pub use channel::{CONTROL_FD, DescriptorChannel, SOCKIN_FD_ENV};
pub use scm::{MAX_FDS_PER_MESSAGE, recv_fds, send_fds};
