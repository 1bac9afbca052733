//! Simple and extended query handling.
//!
//! Reads open a one-shot reader session and stream results back through
//! the relay; writes go through the fan-out coordinator. Extended-protocol
//! replies are fed into the outgoing buffer and flushed at Flush/Sync,
//! which keeps the wire behavior pipelining-friendly.

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::{Portal, PreparedStatement, SessionCodec, SessionState, relay};
use crate::backend::{BackendConnection, with_deadline};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::BackendMessage;
use crate::messages::extendedquery::{
    Bind, BindComplete, Close, CloseComplete, Describe, Execute, Parse, ParseComplete,
    TARGET_TYPE_BYTE_PORTAL, TARGET_TYPE_BYTE_STATEMENT,
};
use crate::messages::response::{
    CommandComplete, EmptyQueryResponse, ReadyForQuery, TransactionStatus,
};
use crate::messages::simplequery::Query;
use crate::messages::data::{NoData, ParameterDescription};
use crate::router::{QueryClass, classify};
use crate::server::ProxyShared;
use crate::session::fanout::{self, WriteStatement};

pub(crate) async fn on_query<S>(
    socket: &mut Framed<S, SessionCodec>,
    shared: &ProxyShared,
    query: Query,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let sql = query.query;

    if sql.trim().is_empty() {
        socket
            .feed(BackendMessage::EmptyQueryResponse(EmptyQueryResponse))
            .await?;
        return ready_for_query(socket).await;
    }

    match classify(&sql) {
        QueryClass::Read => {
            let deadline = tokio::time::Instant::now() + shared.query_deadline;
            let mut conn = with_deadline(
                deadline,
                BackendConnection::connect(&shared.reader, &shared.backend_tls),
            )
            .await?;
            let relayed = relay::relay_simple_query(socket, &mut conn, &sql, deadline).await;
            conn.close().await;
            relayed?;
        }
        QueryClass::Write => {
            let statement = WriteStatement {
                sql: &sql,
                param_types: &[],
                parameters: &[],
                parameter_format_codes: &[],
            };
            let tag = fanout::execute_write(shared, &statement).await?;
            socket
                .feed(BackendMessage::CommandComplete(CommandComplete::new(tag)))
                .await?;
        }
    }

    ready_for_query(socket).await
}

pub(crate) async fn on_parse<S>(
    socket: &mut Framed<S, SessionCodec>,
    parse: Parse,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = parse.name.unwrap_or_default();

    let context = &mut socket.codec_mut().context;
    // the unnamed slot is rebindable, named statements must be closed first
    if !name.is_empty() && context.statements.contains_key(&name) {
        return Err(ProxyError::DuplicateStatement(name));
    }

    let statement = PreparedStatement {
        class: classify(&parse.query),
        name: name.clone(),
        sql: parse.query,
        param_types: parse.type_oids,
    };
    context.statements.insert(name, Arc::new(statement));

    socket
        .feed(BackendMessage::ParseComplete(ParseComplete))
        .await?;
    Ok(())
}

pub(crate) async fn on_bind<S>(socket: &mut Framed<S, SessionCodec>, bind: Bind) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let portal_name = bind.portal_name.unwrap_or_default();
    let statement_name = bind.statement_name.unwrap_or_default();

    let context = &mut socket.codec_mut().context;
    let statement = context
        .statements
        .get(&statement_name)
        .cloned()
        .ok_or(ProxyError::StatementNotFound(statement_name))?;

    let portal = Portal {
        name: portal_name.clone(),
        statement,
        parameters: bind.parameters,
        parameter_format_codes: bind.parameter_format_codes,
        result_format_codes: bind.result_column_format_codes,
    };
    context.portals.insert(portal_name, Arc::new(portal));

    socket.feed(BackendMessage::BindComplete(BindComplete)).await?;
    Ok(())
}

/// Describe replies carry the client-declared parameter types and `NoData`
/// for the row shape: the proxy does not prepare against a backend at
/// Describe time, real shapes arrive with the Execute results.
pub(crate) async fn on_describe<S>(
    socket: &mut Framed<S, SessionCodec>,
    describe: Describe,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = describe.name.unwrap_or_default();

    match describe.target_type {
        TARGET_TYPE_BYTE_STATEMENT => {
            let param_types = {
                let context = &socket.codec().context;
                context
                    .statements
                    .get(&name)
                    .ok_or(ProxyError::StatementNotFound(name))?
                    .param_types
                    .clone()
            };
            socket
                .feed(BackendMessage::ParameterDescription(ParameterDescription::new(
                    param_types,
                )))
                .await?;
            socket.feed(BackendMessage::NoData(NoData)).await?;
        }
        TARGET_TYPE_BYTE_PORTAL => {
            if !socket.codec().context.portals.contains_key(&name) {
                return Err(ProxyError::PortalNotFound(name));
            }
            socket.feed(BackendMessage::NoData(NoData)).await?;
        }
        other => return Err(ProxyError::InvalidTargetType(other)),
    }

    Ok(())
}

pub(crate) async fn on_execute<S>(
    socket: &mut Framed<S, SessionCodec>,
    shared: &ProxyShared,
    execute: Execute,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = execute.name.unwrap_or_default();
    let portal = socket
        .codec()
        .context
        .portals
        .get(&name)
        .cloned()
        .ok_or(ProxyError::PortalNotFound(name))?;

    match portal.statement.class {
        QueryClass::Read => {
            let deadline = tokio::time::Instant::now() + shared.query_deadline;
            let mut conn = with_deadline(
                deadline,
                BackendConnection::connect(&shared.reader, &shared.backend_tls),
            )
            .await?;
            let relayed =
                relay::relay_portal(socket, &mut conn, &portal, execute.max_rows, deadline).await;
            conn.close().await;
            relayed?;
        }
        QueryClass::Write => {
            let statement = WriteStatement {
                sql: &portal.statement.sql,
                param_types: &portal.statement.param_types,
                parameters: &portal.parameters,
                parameter_format_codes: &portal.parameter_format_codes,
            };
            let tag = fanout::execute_write(shared, &statement).await?;
            socket
                .feed(BackendMessage::CommandComplete(CommandComplete::new(tag)))
                .await?;
        }
    }

    Ok(())
}

pub(crate) async fn on_close<S>(
    socket: &mut Framed<S, SessionCodec>,
    close: Close,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = close.name.unwrap_or_default();
    let context = &mut socket.codec_mut().context;

    match close.target_type {
        TARGET_TYPE_BYTE_STATEMENT => {
            context.statements.remove(&name);
            // closing a statement closes the portals built from it
            context.portals.retain(|_, p| p.statement.name != name);
        }
        TARGET_TYPE_BYTE_PORTAL => {
            context.portals.remove(&name);
        }
        other => return Err(ProxyError::InvalidTargetType(other)),
    }

    // closing an unknown slot is not an error, matching stock behavior
    socket
        .feed(BackendMessage::CloseComplete(CloseComplete))
        .await?;
    Ok(())
}

pub(crate) async fn on_sync<S>(socket: &mut Framed<S, SessionCodec>) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // the unnamed portal does not survive the end of the group
    socket.codec_mut().context.portals.remove("");
    ready_for_query(socket).await
}

async fn ready_for_query<S>(socket: &mut Framed<S, SessionCodec>) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    socket.codec_mut().context.state = SessionState::ReadyForQuery;
    socket
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
            TransactionStatus::Idle,
        )))
        .await
}
