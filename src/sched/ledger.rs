/*!
 * CPU Ledger
 * Concurrent per-thread and per-task resource balances
 */

use super::traits::{Ledger, LedgerAccount, LedgerKind};
use dashmap::DashMap;

/// Accumulates credited amounts per (account, kind)
#[derive(Default)]
pub struct CpuLedger {
    balances: DashMap<(LedgerAccount, LedgerKind), u64>,
}

impl CpuLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total credited to `account` for `kind`
    pub fn balance(&self, account: LedgerAccount, kind: LedgerKind) -> u64 {
        self.balances
            .get(&(account, kind))
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    /// CPU time charged to `account`
    pub fn cpu_time(&self, account: LedgerAccount) -> u64 {
        self.balance(account, LedgerKind::CpuTime)
    }

    pub fn accounts(&self) -> usize {
        self.balances.len()
    }
}

impl Ledger for CpuLedger {
    fn credit(&self, account: LedgerAccount, kind: LedgerKind, amount: u64) {
        let mut balance = self.balances.entry((account, kind)).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    fn forget(&self, account: LedgerAccount) {
        self.balances.retain(|(owner, _), _| *owner != account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::{TaskId, ThreadId};

    #[test]
    fn test_credit_accumulates() {
        let ledger = CpuLedger::new();
        let thread = LedgerAccount::Thread(ThreadId::new(1));
        let task = LedgerAccount::Task(TaskId::new(1));

        ledger.credit(thread, LedgerKind::CpuTime, 10);
        ledger.credit(thread, LedgerKind::CpuTime, 5);
        ledger.credit(task, LedgerKind::CpuTime, 15);

        assert_eq!(ledger.cpu_time(thread), 15);
        assert_eq!(ledger.cpu_time(task), 15);
        assert_eq!(ledger.cpu_time(LedgerAccount::Task(TaskId::new(2))), 0);
        assert_eq!(ledger.accounts(), 2);
    }

    #[test]
    fn test_forget_drops_only_that_account() {
        let ledger = CpuLedger::new();
        let thread = LedgerAccount::Thread(ThreadId::new(1));
        let task = LedgerAccount::Task(TaskId::new(1));
        ledger.credit(thread, LedgerKind::CpuTime, 10);
        ledger.credit(task, LedgerKind::CpuTime, 10);

        ledger.forget(thread);
        assert_eq!(ledger.cpu_time(thread), 0);
        assert_eq!(ledger.cpu_time(task), 10);
        assert_eq!(ledger.accounts(), 1);
    }
}
