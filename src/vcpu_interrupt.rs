//! Interface to the Underlying Hypervisor
//!
//! The VMM never touches the physical interrupt controller. Everything the
//! vGIC and the devices need from below goes through [`Hypervisor`]:
//!
//! ## List Register Injection
//! `inject_irq()` programs one of the vCPU's hardware list registers with a
//! virq. The hypervisor later reports that the guest has finished with it
//! (EOI), which arrives at [`crate::devices::gic::Vgic::maintenance`].
//!
//! ## Channels
//! Backend processes (block storage, pass-through IRQ sources) are reached
//! through numbered notification channels. `notify()` wakes the other side,
//! `irq_ack()` re-arms a physical IRQ delivered over a channel.

/// Services the VMM consumes from the hypervisor beneath it.
pub trait Hypervisor {
    /// Load `virq` into list register `lr_idx` of `vcpu`.
    ///
    /// Returns false if the hypervisor refused the injection.
    fn inject_irq(&mut self, vcpu: usize, virq: u32, priority: u8, group: u8, lr_idx: usize) -> bool;

    /// Signal a cooperating process over `channel`.
    fn notify(&mut self, channel: u32);

    /// Acknowledge the physical IRQ delivered on `channel`.
    fn irq_ack(&mut self, channel: u32);
}

/// Callback run when the guest has handled a virq.
///
/// Arguments are the hypervisor, the vCPU, the virq and the cookie given at
/// registration time.
pub type AckFn<H> = fn(&mut H, usize, u32, usize);

/// Ack callback for purely virtual sources (virtio devices). Nothing to
/// re-arm.
pub fn default_ack<H: Hypervisor>(_hv: &mut H, _vcpu: usize, _virq: u32, _cookie: usize) {}

/// Ack callback for a physical IRQ passed through to the guest. The cookie
/// holds the channel the IRQ arrives on.
pub fn passthrough_ack<H: Hypervisor>(hv: &mut H, vcpu: usize, virq: u32, cookie: usize) {
    log::trace!("passthrough ack: vcpu {} virq {} channel {}", vcpu, virq, cookie);
    hv.irq_ack(cookie as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        acked: Vec<u32>,
    }

    impl Hypervisor for Recorder {
        fn inject_irq(&mut self, _vcpu: usize, _virq: u32, _priority: u8, _group: u8, _lr_idx: usize) -> bool {
            true
        }
        fn notify(&mut self, _channel: u32) {}
        fn irq_ack(&mut self, channel: u32) {
            self.acked.push(channel);
        }
    }

    #[test]
    fn test_passthrough_ack_uses_cookie_channel() {
        let mut hv = Recorder::default();
        let ack: AckFn<Recorder> = passthrough_ack;
        ack(&mut hv, 0, 33, 7);
        assert_eq!(hv.acked, vec![7]);
    }

    #[test]
    fn test_default_ack_is_noop() {
        let mut hv = Recorder::default();
        let ack: AckFn<Recorder> = default_ack;
        ack(&mut hv, 1, 48, 0);
        assert!(hv.acked.is_empty());
    }
}
