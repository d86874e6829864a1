use crate::core::Core;
use crate::error::Result;
use crate::events::{
    BlockEvent, OverrideEvent, RebindEvent, TOPIC_BLOCK, TOPIC_OVERRIDE, TOPIC_REBIND,
    publish_event,
};
use crate::plugin::{
    CapturingWriter, Handler, RequestContext, ResponseWriter, answer_response, next_or_failure,
    nxdomain_response,
};
use crate::policy::Decision;
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};

/// TTL on synthesized override answers; kept short so policy changes bite
/// quickly.
const OVERRIDE_TTL: u32 = 1;

/// The filtering plugin: evaluates policy per query, answers or defers to
/// the next handler, and inspects forwarded answers for rebinding.
pub struct BlockHandler {
    core: Arc<Core>,
    next: Option<Arc<dyn Handler>>,
}

impl BlockHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core, next: None }
    }

    pub fn with_next(core: Arc<Core>, next: Arc<dyn Handler>) -> Self {
        Self {
            core,
            next: Some(next),
        }
    }

    async fn forward(
        &self,
        ctx: &mut RequestContext,
        writer: &mut dyn ResponseWriter,
        request: &Message,
    ) -> Result<ResponseCode> {
        next_or_failure(self.name(), self.next.as_deref(), ctx, writer, request).await
    }

    /// Forward through a capturing writer and NXDOMAIN the answer if the
    /// upstream handed back an address a public name has no business
    /// resolving to.
    async fn forward_with_rebind_check(
        &self,
        ctx: &mut RequestContext,
        writer: &mut dyn ResponseWriter,
        request: &Message,
        client_ip: &str,
        qname: &str,
    ) -> Result<ResponseCode> {
        let mut capture = CapturingWriter::new(writer.remote_addr());
        let rcode =
            next_or_failure(self.name(), self.next.as_deref(), ctx, &mut capture, request).await?;

        let Some(upstream) = capture.take() else {
            return Ok(rcode);
        };

        if let Some(bad_ip) = rebind_target(&upstream) {
            warn!(name = qname, ip = %bad_ip, "rebinding attempt blocked");
            writer.write_msg(nxdomain_response(request)).await?;
            publish_event(
                self.core.events.as_ref(),
                TOPIC_REBIND,
                &RebindEvent {
                    client_ip,
                    blocked_ip: &bad_ip.to_string(),
                    name: qname,
                },
            );
            return Ok(ResponseCode::NXDomain);
        }

        let code = upstream.response_code();
        writer.write_msg(upstream).await?;
        Ok(code)
    }
}

#[async_trait]
impl Handler for BlockHandler {
    fn name(&self) -> &'static str {
        "block"
    }

    async fn serve_dns(
        &self,
        ctx: &mut RequestContext,
        writer: &mut dyn ResponseWriter,
        request: &Message,
    ) -> Result<ResponseCode> {
        self.core.metrics.record_query();

        let Some(query) = request.queries().first().cloned() else {
            return self.forward(ctx, writer, request).await;
        };

        let client_ip = writer.remote_addr().ip().to_string();
        let qname = fqdn_of(query.name());
        let qtype = query.query_type();

        ctx.dns_policies = self.core.devices.client_dns_policies(&client_ip);

        let allowance = match self.core.blocked(&client_ip, &qname) {
            Decision::Block { .. } => {
                debug!(name = qname, client = client_ip, "query blocked");
                writer.write_msg(nxdomain_response(request)).await?;
                self.core.metrics.record_blocked();
                publish_event(
                    self.core.events.as_ref(),
                    TOPIC_BLOCK,
                    &BlockEvent {
                        client_ip: &client_ip,
                        name: &qname,
                    },
                );
                return Ok(ResponseCode::NXDomain);
            }
            Decision::Allow(allowance) => allowance,
        };

        if let Some(ip_str) = allowance.return_ip.as_deref() {
            if let Ok(ip) = ip_str.parse::<IpAddr>() {
                if let Some(answer) = synthesize_address(query.name().clone(), qtype, ip) {
                    writer.write_msg(answer_response(request, answer)).await?;
                    publish_event(
                        self.core.events.as_ref(),
                        TOPIC_OVERRIDE,
                        &OverrideEvent {
                            client_ip: &client_ip,
                            ip: ip_str,
                            name: &qname,
                        },
                    );
                    return Ok(ResponseCode::NoError);
                }
            } else {
                warn!(name = qname, ip = ip_str, "unparseable override IP, forwarding");
            }
        }

        if let Some(target) = allowance.return_cname.as_deref() {
            match Name::from_utf8(&fqdn_string(target)) {
                Ok(cname) => {
                    let answer = Record::from_rdata(
                        query.name().clone(),
                        OVERRIDE_TTL,
                        RData::CNAME(CNAME(cname)),
                    );
                    writer.write_msg(answer_response(request, answer)).await?;
                    publish_event(
                        self.core.events.as_ref(),
                        TOPIC_OVERRIDE,
                        &OverrideEvent {
                            client_ip: &client_ip,
                            ip: allowance.return_ip.as_deref().unwrap_or_default(),
                            name: &qname,
                        },
                    );
                    return Ok(ResponseCode::NoError);
                }
                Err(e) => {
                    warn!(name = qname, target, error = %e, "unparseable override CNAME, forwarding");
                }
            }
        }

        ctx.categories = allowance.categories;

        let rebind_active =
            self.core.spr_enabled() && !self.core.config().rebinding_check_disable;
        if allowance.has_permit || !rebind_active {
            return self.forward(ctx, writer, request).await;
        }

        self.forward_with_rebind_check(ctx, writer, request, &client_ip, &qname)
            .await
    }
}

fn fqdn_of(name: &Name) -> String {
    fqdn_string(&name.to_lowercase().to_utf8())
}

fn fqdn_string(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

fn synthesize_address(name: Name, qtype: RecordType, ip: IpAddr) -> Option<Record> {
    match (qtype, ip) {
        (RecordType::A, IpAddr::V4(v4)) => {
            Some(Record::from_rdata(name, OVERRIDE_TTL, RData::A(A(v4))))
        }
        (RecordType::AAAA, IpAddr::V6(v6)) => {
            Some(Record::from_rdata(name, OVERRIDE_TTL, RData::AAAA(AAAA(v6))))
        }
        (RecordType::AAAA, IpAddr::V4(v4)) => Some(Record::from_rdata(
            name,
            OVERRIDE_TTL,
            RData::AAAA(AAAA(v4.to_ipv6_mapped())),
        )),
        _ => None,
    }
}

/// First answer address an external name must never resolve to, if any.
fn rebind_target(msg: &Message) -> Option<IpAddr> {
    for record in msg.answers() {
        let ip = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        if is_rebind_address(ip) {
            return Some(ip);
        }
    }
    None
}

fn is_rebind_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_multicast() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            is_unique_local(&v6) || v6.is_loopback() || v6.is_multicast() || v6.is_unspecified()
        }
    }
}

// fc00::/7, the v6 analogue of RFC 1918 space
fn is_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}
