//! Decode execution on an isolated worker.
//!
//! [`DecodeWorkerService`] is the worker half: it hosts a synchronous
//! [`DecodeFunction`] and serves `decode` calls, running the codec on the
//! blocking thread pool so the worker task stays responsive. The
//! [`RemoteDecoder`] is the controller half: a [`PixelDecoder`] whose
//! every decode is a bridged call. Compressed input and decoded pixels
//! travel as out-of-band payloads, never inside the JSON body.

use super::decoder::{
    DataForDecode, DecodeDone, DecodeError, DecodeFunction, DecodedPixels, DecodedPixelsMeta,
    PixelDecoder,
};
use crate::bridge::{
    BridgeError, ConnectOptions, PathSegment, Payload, RemoteWorker, ServiceError, ServiceReply,
    WorkerContext, WorkerFactory, WorkerService,
};
use crate::region::ImagePartParams;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const INPUT_PAYLOAD_KEY: &str = "data";
const PIXELS_PAYLOAD_KEY: &str = "pixels";

/// Wire shape of a `decode` call's arguments, minus the input payload.
#[derive(Debug, Serialize, Deserialize)]
struct DecodeCallArgs {
    params: ImagePartParams,
    quality: Option<u16>,
}

/// Worker-side service wrapping a synchronous codec.
pub struct DecodeWorkerService {
    decode_fn: Arc<dyn DecodeFunction>,
}

impl DecodeWorkerService {
    pub fn new(decode_fn: Arc<dyn DecodeFunction>) -> Self {
        Self { decode_fn }
    }
}

impl WorkerService for DecodeWorkerService {
    fn invoke(
        &mut self,
        method: &str,
        args: Value,
        payloads: Vec<Payload>,
        _cx: &mut WorkerContext,
    ) -> Result<ServiceReply, ServiceError> {
        match method {
            "decode" => {
                let args: DecodeCallArgs =
                    serde_json::from_value(args).map_err(|err| ServiceError::BadArguments {
                        method: method.to_owned(),
                        reason: err.to_string(),
                    })?;
                let data = payloads
                    .into_iter()
                    .find(|payload| payload_at_key(payload, INPUT_PAYLOAD_KEY))
                    .map(|payload| payload.data)
                    .ok_or_else(|| ServiceError::BadArguments {
                        method: method.to_owned(),
                        reason: "missing input payload".to_owned(),
                    })?;

                let input = DataForDecode {
                    params: args.params,
                    quality: args.quality,
                    data,
                };
                let decode_fn = Arc::clone(&self.decode_fn);
                // The codec is CPU-bound; keep it off the worker task.
                Ok(ServiceReply::Future(
                    async move {
                        let result = tokio::task::spawn_blocking(move || decode_fn.decode(input))
                            .await
                            .map_err(|err| err.to_string())?;
                        let pixels = result.map_err(|err| err.to_string())?;
                        let meta = DecodedPixelsMeta {
                            width: pixels.width,
                            height: pixels.height,
                        };
                        let value =
                            serde_json::to_value(meta).map_err(|err| err.to_string())?;
                        Ok((
                            value,
                            vec![Payload::at_key(PIXELS_PAYLOAD_KEY, pixels.pixels)],
                        ))
                    }
                    .boxed(),
                ))
            }
            other => Err(ServiceError::NoSuchMethod(other.to_owned())),
        }
    }
}

/// Connects a decode worker hosting `decode_fn`.
pub fn decode_worker_factory(decode_fn: Arc<dyn DecodeFunction>) -> Arc<dyn WorkerFactory> {
    Arc::new(move |_ctor_args: &Value, _cx: &mut WorkerContext| {
        Ok(Box::new(DecodeWorkerService::new(Arc::clone(&decode_fn))) as Box<dyn WorkerService>)
    })
}

/// A [`PixelDecoder`] backed by a remote decode worker.
pub struct RemoteDecoder {
    worker: Arc<RemoteWorker>,
}

impl RemoteDecoder {
    /// Spawns a decode worker around `decode_fn` and wires a decoder
    /// onto it. Must be called within a tokio runtime.
    pub fn connect(decode_fn: Arc<dyn DecodeFunction>, options: ConnectOptions) -> Self {
        let worker = RemoteWorker::connect(
            decode_worker_factory(decode_fn),
            json!({}),
            options,
        );
        debug!("remote decoder connected");
        Self {
            worker: Arc::new(worker),
        }
    }

    /// Shuts the underlying worker down; in-flight decodes fail.
    pub fn close(&self) {
        self.worker.close();
    }
}

impl PixelDecoder for RemoteDecoder {
    fn decode(&self, input: DataForDecode, on_done: DecodeDone) {
        let worker = Arc::clone(&self.worker);
        let args = DecodeCallArgs {
            params: input.params,
            quality: input.quality,
        };
        tokio::spawn(async move {
            let result = remote_decode(&worker, args, input.data).await;
            on_done(result);
        });
    }
}

async fn remote_decode(
    worker: &RemoteWorker,
    args: DecodeCallArgs,
    data: bytes::Bytes,
) -> Result<DecodedPixels, DecodeError> {
    let args = serde_json::to_value(args)
        .map_err(|err| DecodeError::InvalidResult(err.to_string()))?;
    let (value, payloads) = worker
        .call_with_result_and_payloads(
            "decode",
            args,
            vec![Payload::at_key(INPUT_PAYLOAD_KEY, data)],
        )
        .await
        .map_err(|err| match err {
            // A codec rejection travels as a promise failure.
            BridgeError::WorkerFailure(reason) => DecodeError::Decoder(reason),
            other => DecodeError::Worker(other.to_string()),
        })?;

    let meta: DecodedPixelsMeta = serde_json::from_value(value)
        .map_err(|err| DecodeError::InvalidResult(err.to_string()))?;
    let pixels = payloads
        .into_iter()
        .find(|payload| payload_at_key(payload, PIXELS_PAYLOAD_KEY))
        .map(|payload| payload.data)
        .ok_or(DecodeError::MissingPayload)?;

    Ok(DecodedPixels {
        width: meta.width,
        height: meta.height,
        pixels,
    })
}

fn payload_at_key(payload: &Payload, key: &str) -> bool {
    payload.path.len() == 1 && payload.path[0] == PathSegment::from(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    /// Codec that doubles every byte of the input.
    fn doubling_codec() -> Arc<dyn DecodeFunction> {
        Arc::new(|input: DataForDecode| {
            let pixels: Vec<u8> = input.data.iter().map(|byte| byte.wrapping_mul(2)).collect();
            Ok(DecodedPixels {
                width: input.params.max_x_exclusive - input.params.min_x,
                height: input.params.max_y_exclusive - input.params.min_y,
                pixels: Bytes::from(pixels),
            })
        })
    }

    fn failing_codec() -> Arc<dyn DecodeFunction> {
        Arc::new(|_input: DataForDecode| {
            Err(DecodeError::Decoder("corrupt stream".to_owned()))
        })
    }

    fn tile_input(data: &'static [u8]) -> DataForDecode {
        DataForDecode {
            params: ImagePartParams::new(0, 0, 256, 256, 0),
            quality: Some(3),
            data: Bytes::from_static(data),
        }
    }

    async fn decode_once(
        decoder: &RemoteDecoder,
        input: DataForDecode,
    ) -> Result<DecodedPixels, DecodeError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        decoder.decode(
            input,
            Box::new(move |result| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            }),
        );
        rx.await.unwrap()
    }

    // ========================================================================
    // Remote decode round trips
    // ========================================================================

    #[tokio::test]
    async fn test_remote_decode_round_trip() {
        let decoder = RemoteDecoder::connect(doubling_codec(), ConnectOptions::default());
        let pixels = decode_once(&decoder, tile_input(&[1, 2, 3])).await.unwrap();
        assert_eq!((pixels.width, pixels.height), (256, 256));
        assert_eq!(pixels.pixels, Bytes::from_static(&[2, 4, 6]));
        decoder.close();
    }

    #[tokio::test]
    async fn test_codec_error_surfaces_as_decoder_error() {
        let decoder = RemoteDecoder::connect(failing_codec(), ConnectOptions::default());
        let err = decode_once(&decoder, tile_input(b"x")).await.unwrap_err();
        assert!(matches!(err, DecodeError::Decoder(reason) if reason.contains("corrupt stream")));
        decoder.close();
    }

    #[tokio::test]
    async fn test_decode_after_close_fails() {
        let decoder = RemoteDecoder::connect(doubling_codec(), ConnectOptions::default());
        decoder.close();
        let err = decode_once(&decoder, tile_input(b"x")).await.unwrap_err();
        assert!(matches!(err, DecodeError::Worker(_)));
    }

    #[tokio::test]
    async fn test_concurrent_decodes_resolve_independently() {
        let decoder = RemoteDecoder::connect(doubling_codec(), ConnectOptions::default());
        let first = decode_once(&decoder, tile_input(&[10]));
        let second = decode_once(&decoder, tile_input(&[20]));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().pixels, Bytes::from_static(&[20]));
        assert_eq!(second.unwrap().pixels, Bytes::from_static(&[40]));
        decoder.close();
    }
}
