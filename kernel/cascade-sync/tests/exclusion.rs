use cascade_arch::{current_cpu, interrupts_enabled};
use cascade_sync::{InterruptExclusion, PreemptionExclusion, PreemptionInterruptExclusion};
use std::sync::atomic::Ordering;

#[test]
fn preemption_tokens_nest_and_balance() {
    let cpu = current_cpu();
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 0);

    let outer = PreemptionExclusion::acquire();
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 1);
    {
        let _inner = PreemptionExclusion::acquire();
        assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 2);
    }
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 1);
    drop(outer);
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 0);
}

#[test]
fn preemption_token_leaves_interrupts_alone() {
    assert!(interrupts_enabled());
    let token = PreemptionExclusion::acquire();
    assert!(interrupts_enabled());
    drop(token);
    assert!(interrupts_enabled());
}

#[test]
fn interrupts_restored_at_outermost_release_only() {
    assert!(interrupts_enabled());

    let outer = InterruptExclusion::acquire();
    assert!(!interrupts_enabled());

    let inner = InterruptExclusion::acquire();
    drop(inner);
    assert!(!interrupts_enabled(), "inner release must not re-enable");

    drop(outer);
    assert!(interrupts_enabled(), "outermost release re-enables");
}

#[test]
fn combined_token_raises_both_counters() {
    let cpu = current_cpu();
    let token = PreemptionInterruptExclusion::acquire();

    assert!(!interrupts_enabled());
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 1);
    assert_eq!(cpu.interrupt_disable_count.load(Ordering::Relaxed), 1);
    assert_eq!(token.cpu().id, cpu.id);

    drop(token);
    assert!(interrupts_enabled());
    assert_eq!(cpu.preemption_disable_count.load(Ordering::Relaxed), 0);
    assert_eq!(cpu.interrupt_disable_count.load(Ordering::Relaxed), 0);
}
