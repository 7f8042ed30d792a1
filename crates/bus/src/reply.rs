//! Status-carrying replies for request handlers.

use keel_core::subject::HEADER_STATUS;
use keel_core::{Error, ErrorBody};
use serde::Serialize;
use tracing::warn;

use crate::{Bus, Message};

/// Reply to `req` with a status and raw payload. Messages without a reply subject are ignored.
pub async fn respond<B: Bus + ?Sized>(bus: &B, req: &Message, status: u16, payload: Vec<u8>) {
    let Some(reply) = &req.reply else { return };
    let msg = Message::new(reply.clone(), payload).with_header(HEADER_STATUS, status.to_string());
    if let Err(e) = bus.publish(msg).await {
        warn!(subject = %req.subject, error = %e, "failed to publish reply");
    }
}

pub async fn respond_json<B: Bus + ?Sized, T: Serialize>(bus: &B, req: &Message, value: &T) {
    match serde_json::to_vec(value) {
        Ok(body) => respond(bus, req, 200, body).await,
        Err(e) => respond_error(bus, req, &Error::Internal(format!("encoding reply: {}", e))).await,
    }
}

pub async fn respond_error<B: Bus + ?Sized>(bus: &B, req: &Message, err: &Error) {
    let body = serde_json::to_vec(&err.to_body()).unwrap_or_default();
    respond(bus, req, err.status(), body).await
}

pub async fn respond_result<B: Bus + ?Sized, T: Serialize>(bus: &B, req: &Message, res: &Result<T, Error>) {
    match res {
        Ok(v) => respond_json(bus, req, v).await,
        Err(e) => respond_error(bus, req, e).await,
    }
}

/// Payload of a successful reply, or the error it carries.
pub fn decode_reply(reply: Message) -> Result<Vec<u8>, Error> {
    match reply.status() {
        None | Some(200) => Ok(reply.payload),
        Some(status) => match serde_json::from_slice::<ErrorBody>(&reply.payload) {
            Ok(body) => Err(body.into()),
            Err(_) => Err(Error::from_status(status, String::from_utf8_lossy(&reply.payload).into_owned())),
        },
    }
}
