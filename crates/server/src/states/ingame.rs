//! In-game state: the authoritative per-player simulation.
//!
//! Clients report what they ate; every claim about this connection's own
//! player is checked against the shared world before it is applied and
//! broadcast. Claims from other connections were already checked by their own
//! state and are only relayed.

use glam::DVec2;
use protocol::{Msg, PlayerMessage, SporeMessage};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::validation::{check_drop_cooldown, check_eat_ratio, check_proximity, ClaimError};
use super::ClientState;
use crate::client::ClientContext;
use crate::db::UpdateBestScore;
use crate::objects::{radius_to_mass, spawn_coords, Player, PlayerRecord, SharedPlayer, Spore};

pub struct InGame {
    player: SharedPlayer,
    span: Span,
    /// Present once the first direction input started the tick.
    tick: Option<CancellationToken>,
    /// Highest best score already sent to the store, written or in flight.
    requested_best: Arc<AtomicI64>,
}

impl InGame {
    pub const NAME: &'static str = "InGame";

    pub fn new(player: Player) -> Self {
        let requested_best = Arc::new(AtomicI64::new(player.best_score));
        Self {
            requested_best,
            player: SharedPlayer::new(player),
            span: Span::none(),
            tick: None,
        }
    }

    pub fn player(&self) -> &SharedPlayer {
        &self.player
    }

    pub fn is_ticking(&self) -> bool {
        self.tick.is_some()
    }

    pub fn set_client(&mut self, ctx: &ClientContext) {
        self.span = info_span!("client", id = ctx.id(), state = Self::NAME);
    }

    pub fn on_enter(&mut self, ctx: &ClientContext) {
        let _span = self.span.clone().entered();
        let game = ctx.config();

        let radius = {
            let mut player = self.player.write();
            player.speed = game.start_speed;
            player.radius = game.start_radius;
            player.radius
        };
        let position = spawn_coords(radius, game.spawn_bound, &ctx.objects().players);
        self.player.write().position = position;

        info!(name = %self.player.read().name, "Adding player to the shared collection");
        ctx.objects().players.insert(ctx.id(), self.player.clone());

        let snapshot = self.player.read().to_message(ctx.id());
        ctx.socket_send(Msg::Player(snapshot));

        tokio::spawn(
            send_initial_spores(ctx.clone(), game.spore_batch_size, game.spore_batch_delay())
                .instrument(self.span.clone()),
        );
    }

    pub fn handle_message(
        &mut self,
        ctx: &ClientContext,
        sender_id: u64,
        msg: Msg,
    ) -> Option<ClientState> {
        let _span = self.span.clone().entered();
        match msg {
            Msg::Player(player) => self.handle_player(ctx, sender_id, player),
            Msg::PlayerDirection { direction } => {
                self.handle_player_direction(ctx, sender_id, direction)
            }
            Msg::Chat { text } => self.handle_chat(ctx, sender_id, text),
            Msg::SporeConsumed { spore_id } => self.handle_spore_consumed(ctx, sender_id, spore_id),
            Msg::PlayerConsumed { player_id } => {
                return self.handle_player_consumed(ctx, sender_id, player_id);
            }
            Msg::Spore(spore) => self.handle_spore(ctx, sender_id, spore),
            _ => {}
        }
        None
    }

    pub fn on_exit(&mut self, ctx: &ClientContext) {
        let _span = self.span.clone().entered();
        if let Some(tick) = self.tick.take() {
            tick.cancel();
        }
        ctx.objects().players.remove(ctx.id());
        self.sync_best_score(ctx);
    }

    fn handle_player(&mut self, ctx: &ClientContext, sender_id: u64, player: PlayerMessage) {
        if sender_id == ctx.id() {
            debug!("Received player message from our own client, ignoring");
            return;
        }
        ctx.socket_send_as(Msg::Player(player), sender_id);
    }

    fn handle_player_direction(&mut self, ctx: &ClientContext, sender_id: u64, direction: f64) {
        if sender_id != ctx.id() {
            debug!(sender_id, "Ignoring direction for a player we do not own");
            return;
        }
        if !direction.is_finite() {
            debug!("Ignoring non-finite direction");
            return;
        }

        self.player.write().direction = direction;

        if self.tick.is_none() {
            let cancel = ctx.shutdown_token().child_token();
            self.tick = Some(cancel.clone());
            tokio::spawn(
                player_update_loop(ctx.clone(), self.player.clone(), cancel)
                    .instrument(self.span.clone()),
            );
        }
    }

    fn handle_chat(&mut self, ctx: &ClientContext, sender_id: u64, text: String) {
        if sender_id == ctx.id() {
            ctx.broadcast(Msg::Chat { text });
        } else {
            ctx.socket_send_as(Msg::Chat { text }, sender_id);
        }
    }

    fn handle_spore_consumed(&mut self, ctx: &ClientContext, sender_id: u64, spore_id: u64) {
        if sender_id != ctx.id() {
            ctx.socket_send_as(Msg::SporeConsumed { spore_id }, sender_id);
            return;
        }

        if let Err(e) = self.consume_spore(ctx, spore_id) {
            warn!(spore_id, error = %e, "Could not verify spore consumption");
        }
    }

    fn consume_spore(&mut self, ctx: &ClientContext, spore_id: u64) -> Result<(), ClaimError> {
        let spores = &ctx.objects().spores;
        let spore = spores
            .get(spore_id)
            .ok_or(ClaimError::SporeNotFound(spore_id))?;

        let game = ctx.config();
        {
            let player = self.player.read();
            check_proximity(
                player.position,
                player.radius,
                DVec2::new(spore.x, spore.y),
                spore.radius,
                game.claim_buffer,
            )?;
            check_drop_cooldown(
                &spore,
                &self.player,
                player.radius,
                player.speed,
                game.claim_buffer,
                Instant::now(),
            )?;
        }

        // Whoever removes the spore first owns it.
        if !spores.remove(spore_id) {
            return Err(ClaimError::AlreadyConsumed(spore_id));
        }

        self.player.write().gain_mass(radius_to_mass(spore.radius));
        ctx.broadcast(Msg::SporeConsumed { spore_id });
        self.sync_best_score(ctx);
        Ok(())
    }

    fn handle_player_consumed(
        &mut self,
        ctx: &ClientContext,
        sender_id: u64,
        player_id: u64,
    ) -> Option<ClientState> {
        if sender_id != ctx.id() {
            ctx.socket_send_as(Msg::PlayerConsumed { player_id }, sender_id);

            if player_id == ctx.id() {
                info!(eaten_by = sender_id, "Player was consumed, respawning");
                return Some(ClientState::InGame(self.respawned()));
            }
            return None;
        }

        if let Err(e) = self.consume_player(ctx, player_id) {
            warn!(player_id, error = %e, "Could not verify player consumption");
        }
        None
    }

    fn consume_player(&mut self, ctx: &ClientContext, victim_id: u64) -> Result<(), ClaimError> {
        let players = &ctx.objects().players;
        let victim = players
            .get(victim_id)
            .ok_or(ClaimError::PlayerNotFound(victim_id))?;
        let (victim_position, victim_radius) = {
            let victim = victim.read();
            (victim.position, victim.radius)
        };

        let game = ctx.config();
        {
            let player = self.player.read();
            check_proximity(
                player.position,
                player.radius,
                victim_position,
                victim_radius,
                game.claim_buffer,
            )?;
            check_eat_ratio(player.radius, victim_radius, game.eat_ratio)?;
        }

        if !players.remove(victim_id) {
            return Err(ClaimError::AlreadyConsumed(victim_id));
        }

        self.player.write().gain_mass(radius_to_mass(victim_radius));
        ctx.broadcast(Msg::PlayerConsumed {
            player_id: victim_id,
        });
        self.sync_best_score(ctx);
        Ok(())
    }

    fn handle_spore(&mut self, ctx: &ClientContext, sender_id: u64, spore: SporeMessage) {
        ctx.socket_send_as(Msg::Spore(spore), sender_id);
    }

    /// A fresh state for the same durable player, back at the starting size.
    fn respawned(&self) -> InGame {
        let player = self.player.read();
        InGame::new(Player::from_record(&PlayerRecord {
            id: player.db_id,
            name: player.name.clone(),
            best_score: player.best_score,
        }))
    }

    /// Persist the current score if it beats the best one on record.
    ///
    /// The write runs on the blocking pool; the in-memory best only advances
    /// once it has succeeded.
    fn sync_best_score(&self, ctx: &ClientContext) -> Option<JoinHandle<()>> {
        let (score, best_score, db_id) = {
            let player = self.player.read();
            (player.score(), player.best_score, player.db_id)
        };
        if score <= best_score.max(self.requested_best.fetch_max(score, Ordering::SeqCst)) {
            return None;
        }

        let params = UpdateBestScore {
            id: db_id,
            best_score: score,
        };
        let db = ctx.db_tx();
        let player = self.player.clone();
        let requested = Arc::clone(&self.requested_best);
        let write = async move {
            match db.update_player_best_score(params).await {
                Ok(()) => {
                    let mut player = player.write();
                    player.best_score = player.best_score.max(score);
                    debug!(best_score = score, "New best score");
                }
                Err(e) => {
                    warn!(error = %e, "Error updating player best score");
                    // Let the next sync retry, unless a higher score is already on its way.
                    let _ = requested.compare_exchange(
                        score,
                        best_score,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
        };
        Some(tokio::spawn(write.instrument(self.span.clone())))
    }
}

/// Move the player every tick until `cancel` fires.
async fn player_update_loop(ctx: ClientContext, player: SharedPlayer, cancel: CancellationToken) {
    let period = ctx.config().tick_interval();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut last = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last).min(period * 2);
                last = now;
                sync_player(&ctx, &player, dt);
            }
        }
    }
}

/// One simulation step: move, maybe shed a spore, publish the snapshot.
fn sync_player(ctx: &ClientContext, shared: &SharedPlayer, dt: Duration) {
    let game = ctx.config();

    let (snapshot, shed) = {
        let mut player = shared.write();
        player.advance(dt.as_secs_f64());

        let mut shed = None;
        if player.radius > game.shed_min_radius {
            let probability = player.radius / (game.max_spores.max(1) as f64 * 5.0);
            if rand::rng().random::<f64>() < probability {
                let radius = (5.0 + player.radius / 50.0).min(15.0);
                shed = Some(Spore::shed_by(
                    shared,
                    player.position.x,
                    player.position.y,
                    radius,
                ));
                player.gain_mass(-radius_to_mass(radius));
            }
        }
        (player.to_message(ctx.id()), shed)
    };

    if let Some(spore) = shed {
        let spore = Arc::new(spore);
        let spore_id = ctx.objects().spores.add(Arc::clone(&spore));
        let msg = Msg::Spore(spore.to_message(spore_id));
        ctx.broadcast(msg.clone());
        ctx.socket_send(msg);
    }

    ctx.broadcast(Msg::Player(snapshot.clone()));
    ctx.socket_send(Msg::Player(snapshot));
}

/// Stream the current spore population to a new player in small batches.
async fn send_initial_spores(ctx: ClientContext, batch_size: usize, delay: Duration) {
    let spores = ctx.objects().spores.snapshot();
    let mut batches = spores.chunks(batch_size.max(1)).peekable();

    while let Some(batch) = batches.next() {
        if ctx.is_closed() {
            return;
        }
        let spores = batch
            .iter()
            .map(|(id, spore)| spore.to_message(*id))
            .collect();
        if !ctx.socket_send(Msg::SporesBatch { spores }) {
            return;
        }
        if batches.peek().is_some() {
            sleep(delay).await;
        }
    }
}
