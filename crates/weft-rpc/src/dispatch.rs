//! Server-side method dispatch.
//!
//! One listener per local method path. A matching `rpc_request` spawns the
//! method body with the caller-side proxy appended, then answers with
//! `rpc_resolve` or the serialized failure as `rpc_reject`.

use std::sync::Arc;

use weft_core::{take_transferables, Body, Cid, MethodDirectory, Peer, RpcEnvelope};

use crate::connection::ConnState;
use crate::remote::Remote;

pub(crate) fn register_servers(
    state: &Arc<ConnState>,
    cid: &Cid,
    directory: &MethodDirectory,
    remote: &Remote,
) {
    for (path, method) in directory.iter() {
        let listener = {
            let weak_state = Arc::downgrade(state);
            let weak_remote = remote.downgrade();
            let method = method.clone();
            let cid = cid.clone();
            let path = path.clone();
            state.port.on(move |delivery| {
                let Body::Rpc(RpcEnvelope::RpcRequest {
                    cid: c,
                    call_id,
                    call_name,
                    args,
                }) = delivery.data()
                else {
                    return;
                };
                if *c != cid || *call_name != path {
                    return;
                }
                let Some(state) = weak_state.upgrade() else { return };
                let Some(remote) = weak_remote.upgrade() else { return };

                let method = method.clone();
                let cid = cid.clone();
                let call_id = call_id.clone();
                let call_name = call_name.clone();
                let args = args.clone();
                tokio::spawn(async move {
                    let outcome = method(args, Peer::attached(Arc::new(remote))).await;
                    let (reply, transfer) = match outcome {
                        Ok(mut result) => {
                            let transfer = take_transferables(&mut result);
                            (
                                RpcEnvelope::RpcResolve {
                                    cid,
                                    call_id,
                                    call_name,
                                    result,
                                },
                                transfer,
                            )
                        }
                        Err(error) => (
                            RpcEnvelope::RpcReject {
                                cid,
                                call_id,
                                call_name,
                                error,
                            },
                            Vec::new(),
                        ),
                    };
                    if let Err(err) = state.send(reply, transfer) {
                        tracing::warn!(error = %err, "failed to send rpc reply");
                    }
                });
            })
        };
        state.track(listener);
    }
}
