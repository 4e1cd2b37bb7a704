use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::protocol::{short_hex, Account, Transaction};
use std::collections::BTreeMap;

/// Parameters the transaction rules depend on.
#[derive(Debug, Clone, Copy)]
pub struct TxRules {
    pub root: Address,
    pub staking_minimum: u64,
    pub block_reward: u64,
}

/// The account replica of this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub accounts: BTreeMap<Address, Account>,
}

fn invalid(message: String) -> ChainError {
    ChainError::Validation(message)
}

impl AccountState {
    pub fn new(accounts: BTreeMap<Address, Account>) -> Self {
        AccountState { accounts }
    }

    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.balance)
    }

    pub fn insert(&mut self, account: Account) {
        self.accounts.insert(account.address, account);
    }

    fn account_mut(&mut self, address: &Address, role: &str) -> Result<&mut Account> {
        self.accounts
            .get_mut(address)
            .ok_or_else(|| invalid(format!("{} account {} does not exist", role, short_hex(address))))
    }

    fn debit(&mut self, address: &Address, amount: u64, role: &str) -> Result<()> {
        let account = self.account_mut(address, role)?;
        account.balance = account.balance.checked_sub(amount).ok_or_else(|| {
            invalid(format!(
                "{} account {} has {} but needs {}",
                role,
                short_hex(address),
                account.balance,
                amount
            ))
        })?;
        Ok(())
    }

    /// Adds `amount` to an existing account.
    pub fn credit(&mut self, address: &Address, amount: u64) -> Result<()> {
        let account = self.account_mut(address, "Credited")?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| invalid(format!("Balance overflow for {}", short_hex(address))))?;
        Ok(())
    }

    fn bump_counter(&mut self, address: &Address, expected: u32) -> Result<()> {
        let account = self.account_mut(address, "Sender")?;
        if account.tx_cnt != expected {
            return Err(invalid(format!(
                "Transaction counter mismatch for {}: expected {}, got {}",
                short_hex(address),
                account.tx_cnt,
                expected
            )));
        }
        account.tx_cnt = account
            .tx_cnt
            .checked_add(1)
            .ok_or_else(|| invalid(format!("Transaction counter overflow for {}", short_hex(address))))?;
        Ok(())
    }

    /// Applies one transaction and returns the fee it pays. On error the
    /// state may be partially modified; callers work on a copy.
    pub fn apply_transaction(&mut self, tx: &Transaction, rules: &TxRules, height: u32) -> Result<u64> {
        match tx {
            Transaction::Acc(tx) => {
                if tx.issuer != rules.root {
                    return Err(invalid(format!(
                        "Account creation issued by {} instead of the root",
                        short_hex(&tx.issuer)
                    )));
                }
                if self.accounts.contains_key(&tx.pub_key) {
                    return Err(invalid(format!(
                        "Account {} already exists",
                        short_hex(&tx.pub_key)
                    )));
                }
                self.debit(&tx.issuer, tx.fee, "Issuer")?;
                let mut account = Account::new(tx.pub_key, tx.issuer, 0);
                account.contract = tx.contract.clone();
                account.contract_variables = tx.contract_variables.clone();
                self.insert(account);
                Ok(tx.fee)
            }
            Transaction::Funds(tx) => {
                if tx.from == tx.to {
                    return Err(invalid("Transfer to self".to_string()));
                }
                if !self.accounts.contains_key(&tx.to) {
                    return Err(invalid(format!(
                        "Receiver account {} does not exist",
                        short_hex(&tx.to)
                    )));
                }
                let total = tx
                    .amount
                    .checked_add(tx.fee)
                    .ok_or_else(|| invalid("Amount plus fee overflows".to_string()))?;
                self.bump_counter(&tx.from, tx.tx_cnt)?;
                self.debit(&tx.from, total, "Sender")?;
                self.credit(&tx.to, tx.amount)?;
                Ok(tx.fee)
            }
            Transaction::Stake(tx) => {
                let account = self.account_mut(&tx.account, "Staking")?;
                if tx.is_staking {
                    if account.is_staking {
                        return Err(invalid(format!(
                            "Account {} is already staking",
                            short_hex(&tx.account)
                        )));
                    }
                    let remaining = account.balance.checked_sub(tx.fee).unwrap_or(0);
                    if account.balance < tx.fee || remaining < rules.staking_minimum {
                        return Err(invalid(format!(
                            "Account {} holds {} after fee, staking minimum is {}",
                            short_hex(&tx.account),
                            remaining,
                            rules.staking_minimum
                        )));
                    }
                    account.is_staking = true;
                    account.commitment_key = tx.commitment_key;
                    account.staking_block_height = height;
                } else {
                    if !account.is_staking {
                        return Err(invalid(format!(
                            "Account {} is not staking",
                            short_hex(&tx.account)
                        )));
                    }
                    account.is_staking = false;
                }
                self.debit(&tx.account, tx.fee, "Staking")?;
                Ok(tx.fee)
            }
            Transaction::Iot(tx) => {
                if !self.accounts.contains_key(&tx.to) {
                    return Err(invalid(format!(
                        "Receiver account {} does not exist",
                        short_hex(&tx.to)
                    )));
                }
                self.bump_counter(&tx.from, tx.tx_cnt)?;
                Ok(0)
            }
        }
    }

    /// State after applying `transactions` in order and paying the
    /// beneficiary the block reward plus all fees. `self` is left untouched.
    pub fn apply_block(
        &self,
        transactions: &[Transaction],
        beneficiary: &Address,
        rules: &TxRules,
        height: u32,
    ) -> Result<AccountState> {
        let mut scratch = self.clone();
        let mut fees: u64 = 0;
        for tx in transactions {
            let fee = scratch.apply_transaction(tx, rules, height)?;
            fees = fees
                .checked_add(fee)
                .ok_or_else(|| invalid("Fee total overflows".to_string()))?;
        }
        let payout = fees
            .checked_add(rules.block_reward)
            .ok_or_else(|| invalid("Block payout overflows".to_string()))?;
        scratch.credit(beneficiary, payout)?;
        Ok(scratch)
    }
}
