// SPDX-License-Identifier: MPL-2.0

//! Device binding: probe/negotiate, thread registration, and teardown
//! (§4.F).
//!
//! Grounded on `device/network/device.rs::init` for the probe sequence
//! (negotiate features, pick header size, attach the MAC, register
//! queues and interrupt handlers) and on its `config_manager`/`ioctl`-
//! adjacent handling in `aster_network`'s `AnyNetworkDevice` for the
//! shape of the post-probe control surface.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::info;

use crate::config::{DeviceParams, MacAddr, NegotiatedFeatures};
use crate::error::ProbeResult;
use crate::pbuf::UpperLayer;
use crate::queue::Queue;
use crate::rx::RxEngine;
use crate::sched::Scheduler;
use crate::stats::{Stats, StatsSnapshot};
use crate::tx::TxEngine;

/// Control-plane requests the upper layer may issue after probe (§6.2).
#[derive(Debug, Clone, Copy)]
pub enum IoctlRequest {
    SetMtu(u16),
    SetUp(bool),
    AddMulticast(MacAddr),
    DelMulticast(MacAddr),
    /// Anything this driver doesn't special-case, delegated to a generic
    /// Ethernet ioctl handler outside this crate's scope.
    Other,
}

/// One bound device instance: the negotiated feature set, the MAC, and
/// the TX/RX engines running against their respective queues.
///
/// `Qt`/`Qr` are separate type parameters because the TX and RX
/// directions bind to independent queue instances, even though both
/// satisfy the same [`Queue`] trait.
pub struct Device<S: Scheduler, Qt: Queue, Qr: Queue> {
    tx: Arc<TxEngine<S, Qt>>,
    stats: Arc<Stats>,
    negotiated: NegotiatedFeatures,
    mac: MacAddr,
    mtu: AtomicU32,
    admin_up: AtomicBool,
    _rx: core::marker::PhantomData<Qr>,
}

impl<S: Scheduler, Qt: Queue + 'static, Qr: Queue + 'static> Device<S, Qt, Qr> {
    /// Probes and binds one device instance (§4.F "On probe").
    ///
    /// `tx_queue`/`rx_queue` must be freshly constructed, unused queues;
    /// this call takes ownership of both, enables indirect descriptors
    /// and masks interrupts on the TX queue, refills the RX queue, and
    /// spawns the dispatcher and poll threads before returning.
    pub fn probe<U: UpperLayer + 'static>(
        sched: Arc<S>,
        mut tx_queue: Qt,
        rx_queue: Qr,
        params: DeviceParams,
        upper: Arc<U>,
    ) -> ProbeResult<Self> {
        let negotiated = NegotiatedFeatures::negotiate(&params)?;
        let header_len = negotiated.net_header_len();
        let stats = Arc::new(Stats::default());

        tx_queue.set_indirect(true);
        tx_queue.disable_interrupts();
        let tx = Arc::new(TxEngine::new(
            sched.clone(),
            tx_queue,
            negotiated.ecn(),
            header_len,
            stats.clone(),
        ));
        tx.spawn_dispatcher();

        let mut rx = RxEngine::new(
            rx_queue,
            upper,
            stats.clone(),
            header_len,
            negotiated.merged_rx_buffers(),
            negotiated.rx_csum(),
        );
        rx.refill();
        sched.spawn("rx-poll", Box::new(move || rx.run()));

        info!(
            "pvnet device bound: mac={:?}, header_len={}, mrg_rxbuf={}",
            params.mac,
            header_len,
            negotiated.merged_rx_buffers()
        );

        Ok(Self {
            tx,
            stats,
            negotiated,
            mac: params.mac,
            mtu: AtomicU32::new(params.mtu as u32),
            admin_up: AtomicBool::new(true),
            _rx: core::marker::PhantomData,
        })
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn negotiated(&self) -> NegotiatedFeatures {
        self.negotiated
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed) as u16
    }

    pub fn is_up(&self) -> bool {
        self.admin_up.load(Ordering::Relaxed)
    }

    /// `xmit` passthrough (§4.D).
    pub fn xmit(&self, pbuf: crate::pbuf::PBuf) -> Result<(), crate::error::OffloadError> {
        self.tx.xmit(pbuf)
    }

    pub fn fill_stats(&self, out: &mut StatsSnapshot) {
        *out = self.stats.snapshot();
    }

    /// Handles a control request (§6.2). MTU and up/down flags are
    /// tracked locally; multicast add/del is a no-op, matching upstream
    /// virtio-net drivers, which don't implement multicast filtering
    /// either.
    pub fn ioctl(&self, req: IoctlRequest) {
        match req {
            IoctlRequest::SetMtu(mtu) => {
                self.mtu.store(mtu as u32, Ordering::Relaxed);
                self.tx.flush();
            }
            IoctlRequest::SetUp(up) => self.admin_up.store(up, Ordering::Relaxed),
            IoctlRequest::AddMulticast(_) | IoctlRequest::DelMulticast(_) => {}
            IoctlRequest::Other => {}
        }
    }

    /// Tears down the TX side (§4.F "On detach"). The RX poll thread
    /// stops on its own once the upper layer reports `!is_running()`
    /// (§4.E step 10); this call only needs to quiesce TX, since that is
    /// the direction this driver actively pushes work into.
    pub fn detach(&self) {
        self.admin_up.store(false, Ordering::Relaxed);
        self.tx.shutdown();
        self.tx.wait_idle();
    }
}
