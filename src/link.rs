//! Link - One instance of the GPP side of the IPC stack
//!
//! Owns the channel engine, both managers and the attach registry, with an
//! explicit setup/destroy lifecycle. Independent links share nothing, so
//! tests can run several side by side.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::chnl::{ChannelEngine, ChannelManager};
use crate::config::LinkConfig;
use crate::drv::LinkDriver;
use crate::error::LinkResult;
use crate::msgq::{LdrvMsgq, MsgqManager};
use crate::osal::{HeapMemory, MemoryService, PrcsToken, Teardown};
use crate::proc::ProcRegistry;
use crate::types::ProcessorId;

/// A configured link
pub struct Link {
    config: LinkConfig,
    engine: Arc<ChannelEngine>,
    procs: Arc<ProcRegistry>,
    chnl: ChannelManager,
    msgq: MsgqManager,
    destroyed: AtomicBool,
}

impl Link {
    /// Build a link over `driver` with heap-backed channel buffers
    pub fn setup(config: LinkConfig, driver: Arc<dyn LinkDriver>) -> LinkResult<Self> {
        Self::setup_with_memory(config, driver, Arc::new(HeapMemory::new()))
    }

    /// Build a link with an explicit memory service for channel buffers
    pub fn setup_with_memory(
        config: LinkConfig,
        driver: Arc<dyn LinkDriver>,
        memory: Arc<dyn MemoryService>,
    ) -> LinkResult<Self> {
        config.validate()?;
        let engine = Arc::new(ChannelEngine::new(
            config.num_dsps,
            config.max_bufs_per_channel,
            Arc::clone(&driver),
        ));

        let mut teardown = Teardown::new("link setup");
        for dsp in 0..config.num_dsps {
            let proc_id = ProcessorId(dsp as u16);
            engine.initialize(proc_id)?;
            let engine = Arc::clone(&engine);
            teardown.push("finalize processor", move || {
                let _ = engine.finalize(proc_id);
            });
        }
        let ldrv = Arc::new(LdrvMsgq::setup(&config, Arc::clone(&engine))?);
        teardown.commit();

        let procs = Arc::new(ProcRegistry::new());
        let chnl = ChannelManager::new(Arc::clone(&engine), Arc::clone(&procs), memory);
        let msgq = MsgqManager::new(ldrv, Arc::clone(&procs));
        info!(
            "link: up with {} dsp(s) over {} driver",
            config.num_dsps,
            driver.name()
        );
        Ok(Self {
            config,
            engine,
            procs,
            chnl,
            msgq,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Tear the link down: transports, queues, allocators, then channels
    pub fn destroy(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.msgq.ldrv().destroy();
        for dsp in 0..self.config.num_dsps {
            let proc_id = ProcessorId(dsp as u16);
            if let Err(e) = self.engine.finalize(proc_id) {
                warn!("link: finalize {}: {}", proc_id, e);
            }
        }
        debug!("link: destroyed");
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ChannelEngine> {
        &self.engine
    }

    pub fn procs(&self) -> &ProcRegistry {
        &self.procs
    }

    /// Channel manager
    pub fn chnl(&self) -> &ChannelManager {
        &self.chnl
    }

    /// Msgq manager
    pub fn msgq(&self) -> &MsgqManager {
        &self.msgq
    }

    pub fn attach(&self, proc_id: ProcessorId, caller: &PrcsToken) -> LinkResult<()> {
        self.procs.attach(proc_id, caller)
    }

    pub fn detach(&self, proc_id: ProcessorId, caller: &PrcsToken) -> LinkResult<()> {
        self.procs.detach(proc_id, caller)
    }

    /// Release everything a departing process still holds
    pub fn cleanup(&self, caller: &PrcsToken) -> usize {
        let released = self.chnl.cleanup(caller) + self.msgq.cleanup(caller);
        if released > 0 {
            debug!("link: released {} object(s) of {:?}", released, caller.id());
        }
        released
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Link")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chnl::ChannelAttrs;
    use crate::drv::NullDriver;
    use crate::error::LinkError;
    use crate::types::ChannelId;

    #[test]
    fn test_setup_initializes_every_dsp() {
        let link = Link::setup(LinkConfig::default().with_num_dsps(2), Arc::new(NullDriver)).unwrap();
        assert!(link.engine().is_initialized(ProcessorId(0)));
        assert!(link.engine().is_initialized(ProcessorId(1)));
        link.destroy();
    }

    #[test]
    fn test_bad_config() {
        let config = LinkConfig::default().with_num_dsps(0);
        assert_eq!(
            Link::setup(config, Arc::new(NullDriver)).unwrap_err(),
            LinkError::InvalidArgument("num_dsps")
        );
    }

    #[test]
    fn test_create_needs_attach() {
        let link = Link::setup(LinkConfig::default(), Arc::new(NullDriver)).unwrap();
        let caller = PrcsToken::create();
        let p0 = ProcessorId(0);
        assert_eq!(
            link.chnl().create(&caller, p0, ChannelId(0), &ChannelAttrs::output(2)),
            Err(LinkError::NotAttached(p0))
        );
        link.attach(p0, &caller).unwrap();
        link.chnl()
            .create(&caller, p0, ChannelId(0), &ChannelAttrs::output(2))
            .unwrap();
        assert_eq!(link.cleanup(&caller), 1);
        link.detach(p0, &caller).unwrap();
    }
}
