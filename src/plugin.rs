use crate::error::{GateError, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;
use std::net::SocketAddr;

/// Per-request scratch state shared down the handler chain.
///
/// `dns_policies` and `categories` are the well-known keys a downstream
/// forwarder consults to steer or annotate the query.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub dns_policies: Vec<String>,
    pub categories: Vec<String>,
}

/// Write half of the host DNS framework: where the final answer goes.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Address of the querying client.
    fn remote_addr(&self) -> SocketAddr;

    async fn write_msg(&mut self, msg: Message) -> Result<()>;
}

/// A plugin in the host server's handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn serve_dns(
        &self,
        ctx: &mut RequestContext,
        writer: &mut dyn ResponseWriter,
        request: &Message,
    ) -> Result<ResponseCode>;
}

/// Delegate to the next plugin, failing with SERVFAIL semantics when the
/// chain ends here.
pub async fn next_or_failure(
    name: &'static str,
    next: Option<&dyn Handler>,
    ctx: &mut RequestContext,
    writer: &mut dyn ResponseWriter,
    request: &Message,
) -> Result<ResponseCode> {
    match next {
        Some(handler) => handler.serve_dns(ctx, writer, request).await,
        None => Err(GateError::NoNextHandler(name.to_string())),
    }
}

/// Start a response message mirroring the request envelope.
fn response_for(request: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    resp
}

/// NXDOMAIN answer for the request.
pub fn nxdomain_response(request: &Message) -> Message {
    let mut resp = response_for(request);
    resp.set_response_code(ResponseCode::NXDomain);
    resp
}

/// Successful single-answer response.
pub fn answer_response(request: &Message, answer: Record) -> Message {
    let mut resp = response_for(request);
    resp.set_response_code(ResponseCode::NoError);
    resp.add_answer(answer);
    resp
}

/// Writer wrapper for post-resolution inspection: stashes the upstream
/// message instead of flushing it, so the caller can examine the answers
/// and decide whether to forward or replace them.
pub struct CapturingWriter {
    remote: SocketAddr,
    captured: Option<Message>,
}

impl CapturingWriter {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            captured: None,
        }
    }

    pub fn take(&mut self) -> Option<Message> {
        self.captured.take()
    }
}

#[async_trait]
impl ResponseWriter for CapturingWriter {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, msg: Message) -> Result<()> {
        self.captured = Some(msg);
        Ok(())
    }
}

/// In-memory writer used by tests to observe what a handler sent.
pub struct BufferedWriter {
    remote: SocketAddr,
    pub sent: Vec<Message>,
}

impl BufferedWriter {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            sent: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.sent.last()
    }
}

#[async_trait]
impl ResponseWriter for BufferedWriter {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, msg: Message) -> Result<()> {
        self.sent.push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4321).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg
    }

    #[test]
    fn test_nxdomain_mirrors_request() {
        let req = query("blocked.example.", RecordType::A);
        let resp = nxdomain_response(&req);

        assert_eq!(resp.id(), 4321);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.queries(), req.queries());
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn test_capturing_writer_defers() {
        let addr: SocketAddr = "1.2.3.4:53".parse().unwrap();
        let mut writer = CapturingWriter::new(addr);

        let req = query("example.com.", RecordType::A);
        writer.write_msg(nxdomain_response(&req)).await.unwrap();

        let captured = writer.take().expect("message captured");
        assert_eq!(captured.response_code(), ResponseCode::NXDomain);
        assert!(writer.take().is_none());
    }
}
