// =============================================================================
// MOONWIRE v1.0 - Collateralization
// =============================================================================
//
// Before the router can forward a transfer it must hold enough balance on
// its side of the recipient channel. When it does not, it funds the channel
// on-chain through the `ChainSender` seam and reconciles the deposit through
// a protocol update, topping up to the rebalance profile's target (or the
// exact requirement when that exceeds the target).
//
// =============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::MemoryChainReader;
use crate::config::RebalanceProfile;
use crate::types::{Address, ChannelState, EngineError};

use super::ForwardingEngine;

// =============================================================================
// Chain Sender
// =============================================================================

/// The on-chain funding seam: submits a deposit transaction to the channel
/// multisig for the router's side. Production deployments wire a real
/// transaction submitter here.
#[async_trait]
pub trait ChainSender: Send + Sync {
    async fn send_deposit_tx(
        &self,
        channel: &ChannelState,
        asset_id: Address,
        amount: u128,
        alice_side: bool,
    ) -> Result<(), EngineError>;
}

/// Chain sender over the in-process chain ledger.
pub struct MemoryChainSender {
    chain: Arc<MemoryChainReader>,
}

impl MemoryChainSender {
    pub fn new(chain: Arc<MemoryChainReader>) -> Arc<Self> {
        Arc::new(MemoryChainSender { chain })
    }
}

#[async_trait]
impl ChainSender for MemoryChainSender {
    async fn send_deposit_tx(
        &self,
        channel: &ChannelState,
        asset_id: Address,
        amount: u128,
        alice_side: bool,
    ) -> Result<(), EngineError> {
        self.chain.credit_deposit(
            &channel.channel_address,
            channel.chain_id,
            &asset_id,
            alice_side,
            amount,
        );
        Ok(())
    }
}

// =============================================================================
// Collateral Logic
// =============================================================================

impl ForwardingEngine {
    /// Make sure our side of `channel` holds at least `required` of
    /// `asset_id`, funding on-chain and reconciling when it does not.
    /// Returns the (possibly updated) channel state.
    pub(crate) async fn ensure_collateral(
        &self,
        channel: &ChannelState,
        asset_id: Address,
        required: u128,
    ) -> Result<ChannelState, EngineError> {
        let side = channel.side_of(&self.identifier).ok_or_else(|| {
            EngineError::validation("router is not a participant of the recipient channel")
                .with_channel(channel.channel_address)
        })?;
        let held = channel
            .balance_for_asset(&asset_id)
            .map(|b| b.amount[side.index()])
            .unwrap_or(0);
        if held >= required {
            return Ok(channel.clone());
        }

        // a syncing provider can report stale deposit totals; funding now
        // would reconcile against them
        if self.chain.get_syncing(channel.chain_id).await? {
            return Err(EngineError::external(format!(
                "chain {} is syncing; collateralization deferred",
                channel.chain_id
            ))
            .with_channel(channel.channel_address));
        }

        // top up to the profile target, or the exact requirement when larger
        let profile = self.profile_for(channel.chain_id, &asset_id);
        let target = profile.map(|p| p.target).unwrap_or(0).max(required);
        let deposit_amount = target - held;

        debug!(
            channel = %channel.channel_address,
            asset = %asset_id,
            held,
            required,
            deposit_amount,
            "collateralizing recipient channel"
        );
        self.chain_sender
            .send_deposit_tx(channel, asset_id, deposit_amount, side.is_alice())
            .await?;

        let updated = self
            .engine
            .deposit(crate::types::DepositParams {
                channel_address: channel.channel_address,
                asset_id,
            })
            .await?;

        let held_now = updated
            .balance_for_asset(&asset_id)
            .map(|b| b.amount[side.index()])
            .unwrap_or(0);
        if held_now < required {
            return Err(EngineError::external(format!(
                "collateralization fell short: need {}, have {}",
                required, held_now
            ))
            .with_channel(channel.channel_address));
        }
        info!(
            channel = %updated.channel_address,
            asset = %asset_id,
            held_now,
            "channel collateralized"
        );
        Ok(updated)
    }

    /// A counterparty asked us to collateralize one of its channels.
    pub async fn handle_collateral_request(
        &self,
        channel_address: Address,
        asset_id: Address,
        amount: Option<u128>,
    ) -> Result<(), EngineError> {
        let channel = self
            .store
            .get_channel_state(&channel_address)
            .await?
            .ok_or_else(|| EngineError::channel_not_found(channel_address))?;
        let profile = self.profile_for(channel.chain_id, &asset_id);
        let required = amount
            .or_else(|| profile.map(|p| p.target))
            .unwrap_or(0);
        if required == 0 {
            return Ok(());
        }
        self.ensure_collateral(&channel, asset_id, required)
            .await
            .map(|_| ())
    }

    pub(crate) fn profile_for(
        &self,
        chain_id: u64,
        asset_id: &Address,
    ) -> Option<&RebalanceProfile> {
        self.rebalance_profiles
            .iter()
            .find(|p| p.chain_id == chain_id && p.asset_id == *asset_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
