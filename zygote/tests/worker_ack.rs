//! Acknowledgement round trip as a worker sees it.
//!
//! This binary holds a single test: it mutates the process environment, which
//! is only sound while no other thread is running.

use std::io::{BufRead, BufReader};
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;

use zygote::WorkerId;
use zygote::env::{EnvSlot, WorkerEnv};
use zygote::worker_ack::{confirm_loaded, done};

#[test]
fn acks_once_then_clears_the_environment() {
    assert!(!confirm_loaded(), "no worker environment yet");

    let (worker_end, supervisor_end) = UnixStream::pair().unwrap();
    let env = WorkerEnv {
        id: WorkerId::new("w-ack"),
        group: "test".to_string(),
        code_version: "v1".to_string(),
        // The ack client takes over the descriptor and closes it.
        status_fd: worker_end.into_raw_fd(),
    };

    unsafe { env.export() };
    assert_eq!(EnvSlot::WorkerId.get().as_deref(), Some("w-ack"));
    assert_eq!(EnvSlot::Group.get().as_deref(), Some("test"));
    assert_eq!(EnvSlot::CodeVersion.get().as_deref(), Some("v1"));
    assert_eq!(
        EnvSlot::StatusFd.get(),
        Some(env.status_fd.to_string())
    );

    assert!(unsafe { done() });

    for slot in EnvSlot::ALL {
        assert_eq!(slot.get(), None, "{} still set", slot.key());
    }
    assert!(!confirm_loaded());

    let mut lines = BufReader::new(supervisor_end).lines();
    assert_eq!(
        lines.next().unwrap().unwrap(),
        r#"{"action":"ack","id":"w-ack"}"#
    );
    assert!(lines.next().is_none());
}
