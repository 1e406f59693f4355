//! pl-proto: wire protocol and blocking session client for the simulator link.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod snapshot;
pub mod wire;

pub use client::{ClientError, ErrorClass, SimClient};
pub use protocol::{
    Command, Event, Frame, FrameRequest, MessageType, DEFAULT_HOST, DEFAULT_PORT, MAX_PAYLOAD_LEN,
};
pub use snapshot::{CheckpointData, Dynamics, SimulationSnapshot, SnapshotError};
pub use wire::WireError;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::*;
    use crate::codec::{encode_command, encode_event, read_command, read_event};

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn roundtrip_over_tcp_dummy_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _peer) = listener.accept().unwrap();
            let cmd = read_command(&mut sock).unwrap();
            assert_eq!(cmd, Command::ExecuteCommand("load map.gbx".to_string()));
            sock.write_all(&encode_event(&Event::CheckpointCountChanged {
                current: 1,
                target: 4,
            }))
            .unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_command(&Command::ExecuteCommand(
                "load map.gbx".to_string(),
            )))
            .unwrap();
        let ev = read_event(&mut client, None).unwrap();
        assert_eq!(
            ev,
            Event::CheckpointCountChanged {
                current: 1,
                target: 4
            }
        );

        server.join().unwrap();
    }
}
