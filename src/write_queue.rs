//! Serialized outbound command queue.
//!
//! All outbound frames funnel through a single queue drained by the writer
//! thread, which doubles as the transport's serializing executor: it runs
//! the connect/negotiate work first and then executes commands strictly in
//! submission order. Commands enqueued before the writer is bound simply
//! wait in the channel. A command may carry a completion that attaches a
//! write failure to the stream that submitted it.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::codec::{ErrorCode, FrameWriter, HeaderField, Http2Settings};
use crate::status::Status;
use crate::stream::ClientStream;
use bytes::Bytes;

/// An outbound command.
pub(crate) enum WriteCmd {
    /// Admit a stream: assign its id, register it, and emit HEADERS. Runs on
    /// the writer thread so stream creation observes connection readiness
    /// and participates in wire-level ordering.
    CreateStream(Arc<ClientStream>),
    Headers {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    Ping {
        ack: bool,
        payload: u64,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    GoAway {
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    Settings {
        ack: bool,
        settings: Http2Settings,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Flush,
    /// Close the writer and the socket; unblocks the reader thread.
    Close,
}

/// What to notify once a command has executed or failed.
pub(crate) enum Completion {
    /// On failure, attach the cause to the stream that submitted the
    /// command. Success needs no notification.
    Stream(Arc<ClientStream>),
}

pub(crate) struct Submission {
    pub cmd: WriteCmd,
    pub done: Option<Completion>,
}

/// Producer side of the queue. Cheap to clone through the transport.
pub(crate) struct WriteQueue {
    tx: Sender<Submission>,
}

impl WriteQueue {
    pub fn new() -> (Self, Receiver<Submission>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Enqueue a command with no completion.
    pub fn enqueue(&self, cmd: WriteCmd) {
        let _ = self.tx.send(Submission { cmd, done: None });
    }

    /// Enqueue a command whose failure should be reported to `stream`.
    pub fn enqueue_for_stream(&self, cmd: WriteCmd, stream: Arc<ClientStream>) {
        let _ = self.tx.send(Submission {
            cmd,
            done: Some(Completion::Stream(stream)),
        });
    }
}

/// Resolve a command's completion with its outcome.
pub(crate) fn complete(done: Option<Completion>, result: io::Result<()>) {
    match done {
        Some(Completion::Stream(stream)) => {
            // A failed write is attached to the stream that submitted the
            // command; transport-level fan-out happens via on_exception.
            if let Err(cause) = result {
                stream.report_status(
                    Status::unavailable("Write failed").with_cause(cause.to_string()),
                    true,
                );
            }
        }
        None => {}
    }
}

/// Apply a command to the bound frame writer.
///
/// `CreateStream` and `Close` are handled by the writer loop itself, not
/// here: the former mutates transport state, the latter tears the writer
/// down.
pub(crate) fn execute(writer: &mut dyn FrameWriter, cmd: &WriteCmd) -> io::Result<()> {
    match cmd {
        WriteCmd::Headers {
            stream_id,
            headers,
            end_stream,
        } => writer.headers(*end_stream, *stream_id, headers),
        WriteCmd::Data {
            stream_id,
            payload,
            end_stream,
        } => writer.data(*end_stream, *stream_id, payload),
        WriteCmd::Ping { ack, payload } => writer.ping(*ack, *payload),
        WriteCmd::RstStream {
            stream_id,
            error_code,
        } => writer.rst_stream(*stream_id, *error_code),
        WriteCmd::GoAway {
            last_good_stream_id,
            error_code,
            debug_data,
        } => writer.goaway(*last_good_stream_id, *error_code, debug_data),
        WriteCmd::Settings { ack, settings } => {
            if *ack {
                writer.ack_settings()
            } else {
                writer.settings(settings)
            }
        }
        WriteCmd::WindowUpdate {
            stream_id,
            increment,
        } => writer.window_update(*stream_id, *increment),
        WriteCmd::Flush => writer.flush(),
        WriteCmd::CreateStream(_) | WriteCmd::Close => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Recorded {
        Headers(u32),
        Data(u32, usize, bool),
        Ping(bool, u64),
        Rst(u32, ErrorCode),
        GoAway(u32, ErrorCode),
        WindowUpdate(u32, u32),
        AckSettings,
        Flush,
    }

    #[derive(Default)]
    struct RecordingWriter {
        frames: Vec<Recorded>,
        fail: bool,
    }

    impl FrameWriter for RecordingWriter {
        fn connection_preface(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn settings(&mut self, _settings: &Http2Settings) -> io::Result<()> {
            Ok(())
        }

        fn ack_settings(&mut self) -> io::Result<()> {
            self.frames.push(Recorded::AckSettings);
            Ok(())
        }

        fn headers(
            &mut self,
            _end_stream: bool,
            stream_id: u32,
            _headers: &[HeaderField],
        ) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom"));
            }
            self.frames.push(Recorded::Headers(stream_id));
            Ok(())
        }

        fn data(&mut self, end_stream: bool, stream_id: u32, payload: &Bytes) -> io::Result<()> {
            self.frames
                .push(Recorded::Data(stream_id, payload.len(), end_stream));
            Ok(())
        }

        fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()> {
            self.frames.push(Recorded::Rst(stream_id, error_code));
            Ok(())
        }

        fn ping(&mut self, ack: bool, payload: u64) -> io::Result<()> {
            self.frames.push(Recorded::Ping(ack, payload));
            Ok(())
        }

        fn goaway(
            &mut self,
            last_good_stream_id: u32,
            error_code: ErrorCode,
            _debug_data: &[u8],
        ) -> io::Result<()> {
            self.frames
                .push(Recorded::GoAway(last_good_stream_id, error_code));
            Ok(())
        }

        fn window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
            self.frames
                .push(Recorded::WindowUpdate(stream_id, increment));
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.frames.push(Recorded::Flush);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn commands_execute_in_submission_order() {
        let (queue, rx) = WriteQueue::new();
        queue.enqueue(WriteCmd::Headers {
            stream_id: 3,
            headers: vec![],
            end_stream: false,
        });
        queue.enqueue(WriteCmd::Data {
            stream_id: 3,
            payload: Bytes::from_static(b"hello"),
            end_stream: true,
        });
        queue.enqueue(WriteCmd::Ping {
            ack: false,
            payload: 1,
        });
        queue.enqueue(WriteCmd::Settings {
            ack: true,
            settings: Http2Settings::default(),
        });
        queue.enqueue(WriteCmd::WindowUpdate {
            stream_id: 0,
            increment: 1024,
        });
        queue.enqueue(WriteCmd::RstStream {
            stream_id: 3,
            error_code: ErrorCode::Cancel,
        });
        queue.enqueue(WriteCmd::GoAway {
            last_good_stream_id: 0,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        });

        let mut writer = RecordingWriter::default();
        while let Ok(sub) = rx.try_recv() {
            execute(&mut writer, &sub.cmd).unwrap();
        }

        assert_eq!(
            writer.frames,
            vec![
                Recorded::Headers(3),
                Recorded::Data(3, 5, true),
                Recorded::Ping(false, 1),
                Recorded::AckSettings,
                Recorded::WindowUpdate(0, 1024),
                Recorded::Rst(3, ErrorCode::Cancel),
                Recorded::GoAway(0, ErrorCode::NoError),
            ]
        );
    }

    #[test]
    fn commands_buffer_until_drained() {
        // Nothing consumes the channel yet: submissions wait, order intact.
        let (queue, rx) = WriteQueue::new();
        for id in [3u32, 5, 7] {
            queue.enqueue(WriteCmd::Headers {
                stream_id: id,
                headers: vec![],
                end_stream: false,
            });
        }
        let ids: Vec<u32> = rx
            .try_iter()
            .map(|sub| match sub.cmd {
                WriteCmd::Headers { stream_id, .. } => stream_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    fn probed_stream() -> (Arc<ClientStream>, crossbeam_channel::Receiver<Status>) {
        use crate::method::{MethodDescriptor, MethodType};
        use crate::stream::StreamListener;
        use bytes::BytesMut;
        use std::sync::Weak;

        struct ClosedProbe(Sender<Status>);
        impl StreamListener for ClosedProbe {
            fn headers_received(&self, _headers: Vec<HeaderField>, _end_stream: bool) {}
            fn data_received(&self, _buf: &mut BytesMut, _end_stream: bool) {}
            fn closed(&self, status: &Status) {
                let _ = self.0.send(status.clone());
            }
        }

        let (tx, rx) = unbounded();
        let stream = Arc::new(ClientStream::new(
            MethodDescriptor::new("svc/M", MethodType::Unary),
            Box::new(ClosedProbe(tx)),
            Weak::new(),
            Vec::new(),
            65_535,
            1 << 20,
        ));
        (stream, rx)
    }

    #[test]
    fn write_failure_is_attached_to_the_submitting_stream() {
        let (queue, rx) = WriteQueue::new();
        let (stream, closed_rx) = probed_stream();
        queue.enqueue_for_stream(
            WriteCmd::Headers {
                stream_id: 3,
                headers: vec![],
                end_stream: false,
            },
            stream.clone(),
        );

        let sub = rx.recv().unwrap();
        let mut writer = RecordingWriter {
            fail: true,
            ..Default::default()
        };
        let result = execute(&mut writer, &sub.cmd);
        complete(sub.done, result);

        let status = closed_rx.try_recv().unwrap();
        assert_eq!(status.code(), crate::status::Code::Unavailable);
        assert_eq!(status.cause(), Some("boom"));
        assert!(stream.is_terminated());
    }

    #[test]
    fn successful_write_leaves_the_stream_untouched() {
        let (queue, rx) = WriteQueue::new();
        let (stream, closed_rx) = probed_stream();
        queue.enqueue_for_stream(
            WriteCmd::Data {
                stream_id: 3,
                payload: Bytes::from_static(b"ok"),
                end_stream: false,
            },
            stream.clone(),
        );

        let sub = rx.recv().unwrap();
        let mut writer = RecordingWriter::default();
        let result = execute(&mut writer, &sub.cmd);
        complete(sub.done, result);

        assert!(closed_rx.try_recv().is_err());
        assert!(!stream.is_terminated());
    }
}
