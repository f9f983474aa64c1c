//! Chess rules adapter backed by shakmaty.
//!
//! Moves are coordinate notation (`e2e4`, `e7e8q`). The adapter owns the
//! position plus the repetition table needed for fivefold-repetition
//! detection, which shakmaty does not track on its own.

use serde::{Deserialize, Serialize};
use shakmaty::{
    fen::Fen, uci::UciMove, CastlingMode, Chess, Color, EnPassantMode, Move, Position,
};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Halfmove clock value at which the seventy-five-move rule ends the game.
pub const SEVENTY_FIVE_MOVE_HALFMOVES: u32 = 150;

/// Occurrences of one position that end the game.
pub const FIVEFOLD_REPETITION: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RulesError {
    #[error("invalid notation: {0}")]
    InvalidNotation(String),

    #[error("illegal move: {0}")]
    IllegalMove(String),

    #[error("invalid FEN: {0}")]
    InvalidFen(String),
}

/// Player color as sent on the wire ("white" / "black").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Automatic game terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    SeventyFiveMoveRule,
    FivefoldRepetition,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Checkmate => "Checkmate",
            Termination::Stalemate => "Stalemate",
            Termination::InsufficientMaterial => "InsufficientMaterial",
            Termination::SeventyFiveMoveRule => "SeventyFiveMoveRule",
            Termination::FivefoldRepetition => "FivefoldRepetition",
        }
    }
}

/// Final result of a finished board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// `None` for draws.
    pub winner: Option<Side>,
    pub method: Termination,
}

impl Outcome {
    fn draw(method: Termination) -> Self {
        Self {
            winner: None,
            method,
        }
    }

    /// Score string: "1-0", "0-1" or "1/2-1/2".
    pub fn result(&self) -> &'static str {
        match self.winner {
            Some(Side::White) => "1-0",
            Some(Side::Black) => "0-1",
            None => "1/2-1/2",
        }
    }
}

/// A chess board with automatic-termination detection.
#[derive(Debug, Clone)]
pub struct ChessBoard {
    position: Chess,
    repetitions: HashMap<String, u32>,
}

impl ChessBoard {
    /// Standard starting position.
    pub fn new() -> Self {
        Self::with_position(Chess::default())
    }

    pub fn from_fen(fen: &str) -> Result<Self, RulesError> {
        let fen: Fen = fen
            .parse()
            .map_err(|e| RulesError::InvalidFen(format!("{e}")))?;
        let position: Chess = fen
            .into_position(CastlingMode::Standard)
            .map_err(|e| RulesError::InvalidFen(format!("{e}")))?;
        Ok(Self::with_position(position))
    }

    fn with_position(position: Chess) -> Self {
        let mut board = Self {
            position,
            repetitions: HashMap::new(),
        };
        board.record_position();
        board
    }

    pub fn to_fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    pub fn side_to_move(&self) -> Side {
        self.position.turn().into()
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.position.halfmoves()
    }

    /// Decode coordinate notation against the current position.
    pub fn decode(&self, notation: &str) -> Result<Move, RulesError> {
        let uci: UciMove = notation
            .parse()
            .map_err(|_| RulesError::InvalidNotation(notation.to_string()))?;
        uci.to_move(&self.position)
            .map_err(|_| RulesError::IllegalMove(notation.to_string()))
    }

    /// Apply a decoded move.
    pub fn apply(&mut self, m: &Move) -> Result<(), RulesError> {
        if !self.position.is_legal(m) {
            return Err(RulesError::IllegalMove(
                UciMove::from_move(m, CastlingMode::Standard).to_string(),
            ));
        }
        self.position.play_unchecked(m);
        self.record_position();
        Ok(())
    }

    /// Decode and apply in one step.
    pub fn play(&mut self, notation: &str) -> Result<(), RulesError> {
        let m = self.decode(notation)?;
        self.apply(&m)
    }

    /// Outcome if the game ended automatically, `None` while it goes on.
    pub fn outcome(&self) -> Option<Outcome> {
        if self.position.is_checkmate() {
            // Side to move is mated
            return Some(Outcome {
                winner: Some(self.side_to_move().opposite()),
                method: Termination::Checkmate,
            });
        }
        if self.position.is_stalemate() {
            return Some(Outcome::draw(Termination::Stalemate));
        }
        if self.position.is_insufficient_material() {
            return Some(Outcome::draw(Termination::InsufficientMaterial));
        }
        if self.halfmove_clock() >= SEVENTY_FIVE_MOVE_HALFMOVES {
            return Some(Outcome::draw(Termination::SeventyFiveMoveRule));
        }
        if self.repetition_count() >= FIVEFOLD_REPETITION {
            return Some(Outcome::draw(Termination::FivefoldRepetition));
        }
        None
    }

    /// Occurrences of the current position so far.
    pub fn repetition_count(&self) -> u32 {
        self.repetitions
            .get(&self.position_key())
            .copied()
            .unwrap_or(0)
    }

    fn record_position(&mut self) {
        *self.repetitions.entry(self.position_key()).or_insert(0) += 1;
    }

    // Placement, side to move, castling rights and en passant square.
    fn position_key(&self) -> String {
        self.to_fen()
            .split_whitespace()
            .take(4)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for ChessBoard {
    fn default() -> Self {
        Self::new()
    }
}
