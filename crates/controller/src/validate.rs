//! Serving a [`Validator`] on the store's validation subjects.

use std::sync::Arc;

use keel_bus::{respond, respond_error, Bus, Message, Subscription};
use keel_core::{subject, Error, Result};
use keel_store::ValidateRequest;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::Validator;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Create,
    Update,
}

/// Answer create and update validation requests for `kind` until `cancel` fires.
/// Replicas share a queue group so each request is answered once.
pub async fn serve_validator(
    bus: Arc<dyn Bus>,
    kind: &str,
    validator: Arc<dyn Validator>,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) -> Result<()> {
    let queue = format!("validate_{}", kind);
    for (phase, subj) in [(Phase::Create, subject::validate_create(kind)), (Phase::Update, subject::validate_update(kind))] {
        let sub = bus.queue_subscribe(&subj, &queue).await?;
        info!(subject = %subj, "serving validator");
        tracker.spawn(run(Arc::clone(&bus), sub, phase, Arc::clone(&validator), cancel.clone()));
    }
    Ok(())
}

async fn run(bus: Arc<dyn Bus>, mut sub: Subscription, phase: Phase, validator: Arc<dyn Validator>, cancel: CancellationToken) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            m = sub.next() => match m {
                Some(m) => m,
                None => break,
            },
        };
        match check(validator.as_ref(), phase, &msg).await {
            Ok(()) => respond(bus.as_ref(), &msg, 200, Vec::new()).await,
            Err(e) => {
                debug!(subject = %msg.subject, error = %e, "validation refused");
                respond_error(bus.as_ref(), &msg, &Error::Validation(e.message().to_string())).await
            }
        }
    }
}

async fn check(validator: &dyn Validator, phase: Phase, msg: &Message) -> Result<()> {
    let req: ValidateRequest = serde_json::from_slice(&msg.payload)?;
    match (phase, &req.old) {
        (Phase::Create, _) => validator.validate_create(&req.new).await,
        (Phase::Update, Some(old)) => validator.validate_update(old, &req.new).await,
        (Phase::Update, None) => Err(Error::BadRequest("update validation without the previous object".into())),
    }
}
