use std::sync::Arc;

use osd_protocol::{ModuleAddress, module::ModuleDescriptor};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    discovery::{DegradedModule, Discovery},
    driver::ModuleDriver,
    error::{ConnectError, NotFound},
    router::{Router, RouterConfig, receive_loop},
    transport::{Link, LinkGuard},
};

/// A connection to a debug target with all its modules discovered.
///
/// Dropping the session closes it.
pub struct Session {
    router: Arc<Router>,
    receive_task: JoinHandle<()>,
    guard: LinkGuard,
}

impl Session {
    /// Opens the configured transport and discovers the modules behind it.
    pub async fn connect(config: Config) -> Result<Session, ConnectError> {
        config.validate()?;
        log::debug!("Connecting with {:?}", config.transport);
        let link = Link::open(&config.transport, config.mtu).await?;
        Session::connect_link(link, config).await
    }

    /// Runs discovery over an already opened link and starts routing on it.
    pub async fn connect_link(mut link: Link, config: Config) -> Result<Session, ConnectError> {
        config.validate()?;
        let report = Discovery::new(&mut link, &config).run().await?;
        for degraded in report.degraded() {
            log::warn!(
                "Module {} is degraded after {} attempt(s): {:?}",
                degraded.address,
                degraded.attempts,
                degraded.reason
            );
        }

        let (sender, receiver, guard) = link.into_parts();
        let router = Arc::new(Router::new(
            Arc::new(report.registry),
            sender,
            RouterConfig::from(&config),
        ));
        let receive_task = tokio::spawn(receive_loop(router.clone(), receiver));
        log::info!(
            "Session established with {} module(s)",
            router.registry().all().len()
        );
        Ok(Session {
            router,
            receive_task,
            guard,
        })
    }

    /// Descriptors of all modules, in enumeration order
    pub fn modules(&self) -> &[ModuleDescriptor] {
        self.router.registry().all()
    }

    /// Addresses on the enumeration walk that never returned a usable descriptor. Under
    /// [`ChainOrder`](crate::discovery::ChainOrder) these are mostly announced slots that stayed
    /// silent.
    pub fn degraded(&self) -> &[DegradedModule] {
        self.router.registry().degraded()
    }

    pub fn descriptor(&self, address: ModuleAddress) -> Result<&ModuleDescriptor, NotFound> {
        self.router.descriptor(address)
    }

    /// The driver matching the type of the module at `address`
    pub fn driver_for(&self, address: ModuleAddress) -> Result<ModuleDriver, NotFound> {
        let descriptor = self.router.descriptor(address)?;
        Ok(ModuleDriver::for_descriptor(descriptor, self.router.clone()))
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Closes the session. Every pending request is resolved with a disconnect error before
    /// this returns. Closing twice has no effect.
    pub fn close(&mut self) {
        if self.router.is_closed() && self.receive_task.is_finished() {
            return;
        }
        self.router.teardown();
        self.receive_task.abort();
        self.guard.close();
    }

    /// Whether the session was closed, either explicitly or by a transport failure
    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use osd_protocol::{
        Flags, Packet, PacketClass,
        module::ModuleType,
        payload::{ProbeReply, RegisterRequest},
    };

    use super::*;
    use crate::{config::Builder, error::RequestError};

    const MAM: ModuleAddress = ModuleAddress::new(0, 2);

    /// Answers discovery with a single memory module and register reads with zero.
    async fn serve_one_module(mut target: Link, answer_reads: bool) {
        while let Some(Ok(frame)) = target.receive().await {
            let request = Packet::decode_exact(&frame, 256).unwrap();
            let reply = if request.flags.contains(Flags::BROADCAST) {
                Packet::new(MAM, PacketClass::Discovery, ProbeReply::default().to_payload())
                    .with_flags(Flags::REPLY)
                    .with_sequence(request.sequence)
            } else if request.class == PacketClass::Discovery {
                request.reply(ModuleDescriptor::standard(MAM, ModuleType::Mam).to_payload())
            } else if answer_reads && RegisterRequest::from_payload(&request.payload).is_ok() {
                request.reply(vec![0, 0])
            } else {
                continue;
            };
            let bytes = Bytes::from(reply.encode(256).unwrap());
            if target.send(bytes).await.is_err() {
                break;
            }
        }
    }

    fn config() -> Config {
        Builder::new()
            .mtu(256)
            .timeout(Duration::from_millis(100))
            .discovery_timeout(Duration::from_millis(50))
            .build()
    }

    #[tokio::test]
    async fn session_routes_to_discovered_module() {
        let (host, target) = Link::pair(256);
        tokio::spawn(serve_one_module(target, true));
        let session = Session::connect_link(host, config()).await.unwrap();
        assert_eq!(session.modules().len(), 1);
        assert!(session.degraded().is_empty());
        let driver = session.driver_for(MAM).unwrap();
        assert_eq!(driver.kind(), "memory");
        assert_eq!(driver.registers().read_u16(0).await.unwrap(), 0);
        assert_eq!(
            session.driver_for(ModuleAddress::new(1, 1)).err(),
            Some(NotFound(ModuleAddress::new(1, 1)))
        );
    }

    #[tokio::test]
    async fn close_resolves_pending_requests() {
        let (host, target) = Link::pair(256);
        tokio::spawn(serve_one_module(target, false));
        let mut session = Session::connect_link(host, config()).await.unwrap();
        let pending = session
            .router()
            .request(MAM, PacketClass::Control, RegisterRequest::Read {
                register: 0,
                width: osd_protocol::payload::RegisterWidth::W16,
            }
            .to_payload())
            .await
            .unwrap();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(pending.wait().await, Err(RequestError::Disconnected)));
        session.close();
    }

    #[tokio::test]
    async fn transport_loss_tears_session_down() {
        let (host, target) = Link::pair(256);
        let server = tokio::spawn(serve_one_module(target, true));
        let session = Session::connect_link(host, config()).await.unwrap();
        server.abort();
        let _ = server.await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
