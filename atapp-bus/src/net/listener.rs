// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! TCP accept loop feeding incoming sessions to the connector

use std::cell::RefCell;
use std::rc::Weak;

use tokio::net::TcpListener;

use crate::connector::BusConnector;

/// Accept connections on `listener` until the connector goes away.
pub(crate) fn spawn_listener(
    connector: Weak<RefCell<BusConnector>>,
    listener: TcpListener,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!("TCP session opened for {addr}");
                    let Some(connector) = connector.upgrade() else {
                        break;
                    };
                    connector.borrow_mut().accept_stream(stream);
                }
                Err(socket_accept_error) => {
                    tracing::warn!("error accepting socket {socket_accept_error} on bus listener");
                }
            }
        }
    })
}
