//! [`ControlCodec`] implementations: JSON (the engine's native form) and CBOR.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::application::ports::ControlCodec;
use crate::domain::control::{ConnectReply, ControlFrame};
use crate::domain::media::DeviceCatalog;
use crate::error::ChannelError;

/// Which codec an engine channel speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Json,
    Cbor,
}

impl CodecKind {
    pub fn build(self) -> Box<dyn ControlCodec> {
        match self {
            Self::Json => Box::new(JsonControlCodec),
            Self::Cbor => Box::new(CborControlCodec),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Encodes / decodes control payloads as JSON (via `serde_json`).
pub struct JsonControlCodec;

impl ControlCodec for JsonControlCodec {
    fn encode(&self, frame: &ControlFrame) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(frame).map_err(malformed)
    }

    fn decode_frame(&self, data: &[u8]) -> Result<ControlFrame, ChannelError> {
        from_json(data)
    }

    fn decode_catalog(&self, data: &[u8]) -> Result<DeviceCatalog, ChannelError> {
        from_json(data)
    }

    fn decode_connect(&self, data: &[u8]) -> Result<ConnectReply, ChannelError> {
        from_json(data)
    }
}

fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(data).map_err(malformed)
}

// ---------------------------------------------------------------------------
// CBOR
// ---------------------------------------------------------------------------

/// Encodes / decodes control payloads using CBOR (via `serde_cbor`).
pub struct CborControlCodec;

impl ControlCodec for CborControlCodec {
    fn encode(&self, frame: &ControlFrame) -> Result<Vec<u8>, ChannelError> {
        serde_cbor::to_vec(frame).map_err(malformed)
    }

    fn decode_frame(&self, data: &[u8]) -> Result<ControlFrame, ChannelError> {
        from_cbor(data)
    }

    fn decode_catalog(&self, data: &[u8]) -> Result<DeviceCatalog, ChannelError> {
        from_cbor(data)
    }

    fn decode_connect(&self, data: &[u8]) -> Result<ConnectReply, ChannelError> {
        from_cbor(data)
    }
}

fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T, ChannelError> {
    serde_cbor::from_slice(data).map_err(malformed)
}

fn malformed(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Malformed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};

    use futures_util::FutureExt;
    use proptest::prelude::*;

    use crate::adapters::engine::framing::{Framing, DEFAULT_MAX_FRAME_LEN, LEGACY_FRAME_LEN};
    use crate::domain::media::{MediaConfig, StreamDirection};
    use crate::testing::{addr, catalog, config};

    fn stream_frame() -> ControlFrame {
        ControlFrame::Stream {
            remote_addr: addr("1.2.3.4:9000"),
            mode: StreamDirection::Return,
            config: config(),
        }
    }

    #[test]
    fn json_stream_command_matches_engine_wire_form() {
        let bytes = JsonControlCodec.encode(&stream_frame()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "stream");
        assert_eq!(value["remote_addr"], "1.2.3.4:9000");
        assert_eq!(value["mode"], "Return");
        assert_eq!(value["config"]["sampleRate"], 48_000);
    }

    #[test]
    fn both_codecs_preserve_commands() {
        for kind in [CodecKind::Json, CodecKind::Cbor] {
            let codec = kind.build();
            let frames = [
                ControlFrame::Config,
                ControlFrame::Connect {
                    config: Some(config()),
                },
                stream_frame(),
            ];
            for frame in frames {
                let bytes = codec.encode(&frame).unwrap();
                assert_eq!(codec.decode_frame(&bytes).unwrap(), frame, "{kind:?}");
            }
        }
    }

    fn media_config() -> impl Strategy<Value = MediaConfig> {
        let names = ("\\PC{0,24}", "\\PC{0,48}", "\\PC{0,48}");
        let format = (any::<u32>(), any::<u32>(), any::<bool>());
        let channels = (any::<u32>(), any::<u32>());
        (names, format, channels).prop_map(|(names, format, channels)| MediaConfig {
            host: names.0,
            input_device: names.1,
            output_device: names.2,
            sample_rate: format.0,
            buffer_size: format.1,
            stereo: format.2,
            input_channel: channels.0,
            output_channel: channels.1,
        })
    }

    fn socket_addr() -> impl Strategy<Value = SocketAddr> {
        let ip = prop_oneof![
            any::<[u8; 4]>().prop_map(IpAddr::from),
            any::<[u8; 16]>().prop_map(IpAddr::from),
        ];
        (ip, any::<u16>()).prop_map(|(ip, port)| SocketAddr::new(ip, port))
    }

    fn control_frame() -> impl Strategy<Value = ControlFrame> {
        let direction = prop_oneof![Just(StreamDirection::Send), Just(StreamDirection::Return)];
        prop_oneof![
            Just(ControlFrame::Config),
            proptest::option::of(media_config())
                .prop_map(|config| ControlFrame::Connect { config }),
            (socket_addr(), direction, media_config()).prop_map(|(remote_addr, mode, config)| {
                ControlFrame::Stream {
                    remote_addr,
                    mode,
                    config,
                }
            }),
        ]
    }

    /// Encodes, frames, reads back and decodes `frame`.
    fn through_the_wire(
        kind: CodecKind,
        framing: Framing,
        frame: &ControlFrame,
    ) -> Result<ControlFrame, ChannelError> {
        let codec = kind.build();
        let payload = codec.encode(frame)?;
        let wire = framing.encode(frame.command(), &payload)?;
        let read = framing
            .read_frame(&mut &wire[..])
            .now_or_never()
            .expect("reading from a slice never waits")?;
        codec.decode_frame(&read)
    }

    proptest! {
        #[test]
        fn frames_below_the_bound_survive_the_wire(
            frame in control_frame(),
            max_len in prop_oneof![Just(128usize), Just(512), Just(DEFAULT_MAX_FRAME_LEN)],
            frame_len in prop_oneof![Just(LEGACY_FRAME_LEN), Just(1024usize)],
        ) {
            let setups = [
                (CodecKind::Json, Framing::LengthPrefixed { max_len }),
                (CodecKind::Cbor, Framing::LengthPrefixed { max_len }),
                (CodecKind::Json, Framing::Padded { frame_len }),
            ];
            for (kind, framing) in setups {
                let len = kind.build().encode(&frame).unwrap().len();
                match through_the_wire(kind, framing, &frame) {
                    Ok(decoded) => {
                        prop_assert!(len < framing.bound());
                        prop_assert_eq!(&decoded, &frame);
                    }
                    Err(ChannelError::FrameTooLarge { len: refused, max, .. }) => {
                        prop_assert_eq!(refused, len);
                        prop_assert_eq!(max, framing.bound());
                        prop_assert!(len >= max);
                    }
                    Err(e) => prop_assert!(false, "{:?} over {:?}: {}", kind, framing, e),
                }
            }
        }
    }

    #[test]
    fn cbor_catalog_reply_decodes() {
        let bytes = serde_cbor::to_vec(&catalog()).unwrap();
        assert_eq!(CborControlCodec.decode_catalog(&bytes).unwrap(), catalog());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            JsonControlCodec.decode_connect(b"not json"),
            Err(ChannelError::Malformed(_))
        ));
    }
}
