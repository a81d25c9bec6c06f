use std::marker::PhantomData;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::IpcError;

/// A decompressed archive upload travels the command channel base64-encoded
/// inside a JSON frame, so frames need generous headroom over the 20 MiB
/// archive bound.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length-prefixed JSON frames carrying one message type per direction.
pub(crate) struct JsonFrame<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> Default for JsonFrame<T> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> tokio_util::codec::Decoder for JsonFrame<T>
where
    T: serde::de::DeserializeOwned,
{
    type Item = T;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, IpcError> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<T> tokio_util::codec::Encoder<&T> for JsonFrame<T>
where
    T: serde::Serialize,
{
    type Error = IpcError;

    fn encode(&mut self, msg: &T, dst: &mut BytesMut) -> Result<(), IpcError> {
        let payload = serde_json::to_vec(msg)?;
        self.inner.encode(Bytes::from(payload), dst)?;

        Ok(())
    }
}
