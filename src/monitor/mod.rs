//! Periodic snapshot-and-accumulate pass over the hardware performance
//! counters.
//!
//! The monitor owns the lifetime accumulators; once per measurement interval
//! the caller runs [`PerfMonitor::sample`], which snapshots every device and
//! link counter group, folds it into the running sums and hands both the
//! instantaneous and the lifetime view to a [`PerfReporter`].

use alloc::vec::Vec;

use log::info;

use crate::flib::constants::{PKT_CLK_HZ, perf_interval_cycles};
use crate::flib::{DataSource, FlibDevice, LinkPerf, LinkStatus};

/// `counter / cycles`, with an empty measurement window reported as no data
/// instead of NaN.
pub fn ratio(counter: u64, cycles: u64) -> Option<f64> {
    if cycles == 0 {
        None
    } else {
        Some(counter as f64 / cycles as f64)
    }
}

fn event_rate(events: u64, pkt_cycles: u64) -> Option<f64> {
    ratio(events, pkt_cycles).map(|r| r * PKT_CLK_HZ as f64)
}

#[derive(Debug, Default, Clone, Copy)]
struct PciAcc {
    cycles: u64,
    stall: u64,
    trans: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct DmaAcc {
    cycles: u64,
    fifo_fill: [u64; 8],
    overflow: u64,
}

/// Device-scope sample: instantaneous values for the last interval plus the
/// lifetime aggregate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceSample {
    pub pci_stall: Option<f64>,
    pub pci_trans: Option<f64>,
    pub pci_idle: Option<f64>,
    pub pci_stall_total: Option<f64>,
    pub pci_trans_total: Option<f64>,
    pub pci_idle_total: Option<f64>,
    /// Longest single stall of the interval in microseconds
    pub pci_max_stall_us: f32,
    /// Fraction of cycles spent at 1/8 .. 8/8 DMA mux FIFO fill
    pub fifo_fill: [Option<f64>; 8],
    pub fifo_fill_total: [Option<f64>; 8],
    pub overflow: u64,
    pub overflow_total: u64,
}

/// Link-scope sample, stall ratios over the packetizer cycle counter and the
/// microslice processing rate in Hz.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkSample {
    pub data_source: Option<DataSource>,
    pub status: LinkStatus,
    pub din_full: Option<f64>,
    pub din_full_total: Option<f64>,
    pub dma_stall: Option<f64>,
    pub dma_stall_total: Option<f64>,
    pub data_buf_stall: Option<f64>,
    pub data_buf_stall_total: Option<f64>,
    pub desc_buf_stall: Option<f64>,
    pub desc_buf_stall_total: Option<f64>,
    pub event_rate_hz: Option<f64>,
    pub event_rate_hz_total: Option<f64>,
}

/// Sink for the per-interval samples.
pub trait PerfReporter {
    fn device_sample(&mut self, device: usize, sample: &DeviceSample);
    fn link_sample(&mut self, device: usize, link: usize, sample: &LinkSample);
}

/// Drives the measurement contract across a set of devices.
pub struct PerfMonitor {
    interval_cycles: u64,
    pci: Vec<PciAcc>,
    dma: Vec<DmaAcc>,
    links: Vec<Vec<LinkPerf>>,
}

impl PerfMonitor {
    /// Programs the common measurement interval everywhere and arms the
    /// counters. The first hardware window starts now; call
    /// [`PerfMonitor::sample`] once per interval from then on.
    pub fn new(devices: &[FlibDevice], interval_ms: u32) -> Self {
        for dev in devices {
            dev.set_perf_interval(interval_ms);
            // dummy read to reset the latched counters
            let _ = dev.get_dma_perf();
        }
        let interval_cycles = match devices.first() {
            Some(dev) => dev.get_perf_interval_cycles() as u64,
            None => perf_interval_cycles(interval_ms) as u64,
        };
        Self {
            interval_cycles,
            pci: devices.iter().map(|_| PciAcc::default()).collect(),
            dma: devices.iter().map(|_| DmaAcc::default()).collect(),
            links: devices
                .iter()
                .map(|dev| dev.links().iter().map(|_| LinkPerf::default()).collect())
                .collect(),
        }
    }

    /// Length of one measurement window in packet clock cycles.
    pub fn interval_cycles(&self) -> u64 {
        self.interval_cycles
    }

    /// Snapshots all counters, folds them into the lifetime accumulators and
    /// reports every sample.
    pub fn sample(&mut self, devices: &[FlibDevice], reporter: &mut dyn PerfReporter) {
        for (j, dev) in devices.iter().enumerate() {
            reporter.device_sample(j, &self.sample_device(j, dev));
            for (i, link) in dev.links().iter().enumerate() {
                let perf = link.link_perf();
                let acc = &mut self.links[j][i];
                acc.pkt_cycle_cnt += perf.pkt_cycle_cnt;
                acc.dma_stall += perf.dma_stall;
                acc.data_buf_stall += perf.data_buf_stall;
                acc.desc_buf_stall += perf.desc_buf_stall;
                acc.events += perf.events;
                acc.gtx_cycle_cnt += perf.gtx_cycle_cnt;
                acc.din_full_gtx += perf.din_full_gtx;

                let sample = LinkSample {
                    data_source: Some(link.data_source()),
                    status: link.link_status(),
                    din_full: ratio(perf.din_full_gtx, perf.gtx_cycle_cnt),
                    din_full_total: ratio(acc.din_full_gtx, acc.gtx_cycle_cnt),
                    dma_stall: ratio(perf.dma_stall, perf.pkt_cycle_cnt),
                    dma_stall_total: ratio(acc.dma_stall, acc.pkt_cycle_cnt),
                    data_buf_stall: ratio(perf.data_buf_stall, perf.pkt_cycle_cnt),
                    data_buf_stall_total: ratio(acc.data_buf_stall, acc.pkt_cycle_cnt),
                    desc_buf_stall: ratio(perf.desc_buf_stall, perf.pkt_cycle_cnt),
                    desc_buf_stall_total: ratio(acc.desc_buf_stall, acc.pkt_cycle_cnt),
                    event_rate_hz: event_rate(perf.events, perf.pkt_cycle_cnt),
                    event_rate_hz_total: event_rate(acc.events, acc.pkt_cycle_cnt),
                };
                reporter.link_sample(j, i, &sample);
            }
        }
    }

    fn sample_device(&mut self, j: usize, dev: &FlibDevice) -> DeviceSample {
        let stall_cycles = dev.get_pci_stall() as u64;
        let trans_cycles = dev.get_pci_trans() as u64;
        let pci = &mut self.pci[j];
        pci.cycles += self.interval_cycles;
        pci.stall += stall_cycles;
        pci.trans += trans_cycles;

        let idle = |stall: Option<f64>, trans: Option<f64>| match (stall, trans) {
            (Some(s), Some(t)) => Some(1.0 - s - t),
            _ => None,
        };
        let pci_stall = ratio(stall_cycles, self.interval_cycles);
        let pci_trans = ratio(trans_cycles, self.interval_cycles);
        let pci_stall_total = ratio(pci.stall, pci.cycles);
        let pci_trans_total = ratio(pci.trans, pci.cycles);

        let dma_perf = dev.get_dma_perf();
        let dma = &mut self.dma[j];
        dma.cycles += dma_perf.cycle_cnt;
        dma.overflow += dma_perf.overflow;
        let mut fifo_fill = [None; 8];
        let mut fifo_fill_total = [None; 8];
        for (bucket, fill) in dma_perf.fifo_fill.iter().enumerate() {
            dma.fifo_fill[bucket] += *fill;
            fifo_fill[bucket] = ratio(*fill, dma_perf.cycle_cnt);
            fifo_fill_total[bucket] = ratio(dma.fifo_fill[bucket], dma.cycles);
        }

        DeviceSample {
            pci_stall,
            pci_trans,
            pci_idle: idle(pci_stall, pci_trans),
            pci_stall_total,
            pci_trans_total,
            pci_idle_total: idle(pci_stall_total, pci_trans_total),
            pci_max_stall_us: dev.get_pci_max_stall(),
            fifo_fill,
            fifo_fill_total,
            overflow: dma_perf.overflow,
            overflow_total: dma.overflow,
        }
    }
}

/// Reporter that prints every sample through the logging facade.
pub struct LogReporter;

fn pct(value: Option<f64>) -> f64 {
    match value {
        Some(v) => v * 100.0,
        None => 0.0,
    }
}

impl PerfReporter for LogReporter {
    fn device_sample(&mut self, device: usize, sample: &DeviceSample) {
        info!(
            "flib {}: PCIe idle {:.4} stall {:.4} (max {:.1} us) trans {:.4} | avg idle {:.4} stall {:.4} trans {:.4}",
            device,
            pct(sample.pci_idle),
            pct(sample.pci_stall),
            sample.pci_max_stall_us,
            pct(sample.pci_trans),
            pct(sample.pci_idle_total),
            pct(sample.pci_stall_total),
            pct(sample.pci_trans_total),
        );
    }

    fn link_sample(&mut self, device: usize, link: usize, sample: &LinkSample) {
        let source = match sample.data_source {
            Some(sel) => sel,
            None => DataSource::Disable,
        };
        info!(
            "link {}/{}: {} up {} dma_s {:.3} data_s {:.3} desc_s {:.3} bp {:.3} rate {:.0} Hz",
            device,
            link,
            source,
            sample.status.channel_up,
            pct(sample.dma_stall),
            pct(sample.data_buf_stall),
            pct(sample.desc_buf_stall),
            pct(sample.din_full),
            sample.event_rate_hz.unwrap_or(0.0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flib::constants::*;
    use crate::sim::SimFlib;
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct CollectingReporter {
        devices: Vec<DeviceSample>,
        links: Vec<LinkSample>,
    }

    impl PerfReporter for CollectingReporter {
        fn device_sample(&mut self, _device: usize, sample: &DeviceSample) {
            self.devices.push(*sample);
        }

        fn link_sample(&mut self, _device: usize, _link: usize, sample: &LinkSample) {
            self.links.push(*sample);
        }
    }

    fn setup() -> (Arc<SimFlib>, Vec<FlibDevice>) {
        let sim = SimFlib::new(1);
        let dev = crate::flib::FlibDevice::new(sim.clone()).unwrap();
        (sim, vec![dev])
    }

    #[test]
    fn zero_cycles_yield_no_data() {
        assert_eq!(ratio(10, 0), None);
        assert_eq!(ratio(10, 100), Some(0.1));
        assert_eq!(event_rate(0, 0), None);
    }

    #[test]
    fn construction_arms_the_interval() {
        let (sim, devices) = setup();
        let monitor = PerfMonitor::new(&devices, 1000);
        assert_eq!(monitor.interval_cycles(), 100_000_000);
        assert_eq!(sim.global_reg(REG_SYS_PERF_INT), 100_000_000);
    }

    #[test]
    fn lifetime_ratio_matches_offline_sum() {
        let (sim, devices) = setup();
        let mut monitor = PerfMonitor::new(&devices, 1000);
        let interval = monitor.interval_cycles();

        let stalls = [1_000_000u64, 3_000_000, 2_000_000];
        let mut reporter = CollectingReporter::default();
        for stall in stalls {
            sim.set_global_reg(REG_PERF_PCI_NRDY, stall as u32);
            sim.set_global_reg(REG_PERF_PCI_TRANS, 10_000_000);
            monitor.sample(&devices, &mut reporter);
        }

        let offline: u64 = stalls.iter().sum();
        let expected = offline as f64 / (3 * interval) as f64;
        let last = reporter.devices.last().unwrap();
        assert_eq!(last.pci_stall_total, Some(expected));
        assert_eq!(last.pci_stall, Some(2_000_000 as f64 / interval as f64));
    }

    #[test]
    fn idle_is_the_remainder() {
        let (sim, devices) = setup();
        let mut monitor = PerfMonitor::new(&devices, 1000);
        sim.set_global_reg(REG_PERF_PCI_NRDY, 10_000_000);
        sim.set_global_reg(REG_PERF_PCI_TRANS, 40_000_000);

        let mut reporter = CollectingReporter::default();
        monitor.sample(&devices, &mut reporter);
        let sample = reporter.devices[0];
        let idle = sample.pci_idle.unwrap();
        assert!((idle - 0.5).abs() < 1e-9);
    }

    #[test]
    fn link_ratios_and_event_rate() {
        let (sim, devices) = setup();
        let mut monitor = PerfMonitor::new(&devices, 1000);
        sim.set_pkt_reg(0, REG_PERF_CYCLE_CNT, 100_000_000);
        sim.set_pkt_reg(0, REG_PERF_DMA_STALL, 25_000_000);
        sim.set_pkt_reg(0, REG_PERF_N_EVENTS, 100_000);
        sim.set_gtx_reg(0, REG_GTX_PERF_CYCLE_CNT, 50_000_000);
        sim.set_gtx_reg(0, REG_GTX_PERF_PKT_AFULL, 5_000_000);

        let mut reporter = CollectingReporter::default();
        monitor.sample(&devices, &mut reporter);
        let sample = reporter.links[0];
        assert_eq!(sample.dma_stall, Some(0.25));
        assert_eq!(sample.din_full, Some(0.1));
        // 100k events in 1 s of packet clock
        assert_eq!(sample.event_rate_hz, Some(100_000.0));
        assert_eq!(sample.data_source, Some(DataSource::Disable));
    }

    #[test]
    fn accumulators_survive_idle_windows() {
        let (sim, devices) = setup();
        let mut monitor = PerfMonitor::new(&devices, 1000);
        let mut reporter = CollectingReporter::default();

        // link counters stay zero, every ratio must be reported as no data
        monitor.sample(&devices, &mut reporter);
        let sample = reporter.links[0];
        assert_eq!(sample.dma_stall, None);
        assert_eq!(sample.event_rate_hz, None);

        // a later window with data still accumulates from zero
        sim.set_pkt_reg(0, REG_PERF_CYCLE_CNT, 1000);
        sim.set_pkt_reg(0, REG_PERF_DMA_STALL, 500);
        monitor.sample(&devices, &mut reporter);
        let sample = reporter.links.last().unwrap();
        assert_eq!(sample.dma_stall_total, Some(0.5));
    }
}
