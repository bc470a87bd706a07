use uuid::Uuid;

use parley_types::models::{GameStatus, GameView};

use crate::error::{GatewayResult, conflict, denied, validation};

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    X,
    O,
}

/// One tic-tac-toe match. The server is the only judge of legality.
#[derive(Debug, Clone)]
pub struct TicTacToe {
    pub id: Uuid,
    player_x: Uuid,
    player_o: Uuid,
    board: [Option<Mark>; 9],
    turn: Mark,
    status: GameStatus,
    winner: Option<Uuid>,
}

impl TicTacToe {
    /// The challenger plays X and moves first.
    pub fn new(challenger: Uuid, opponent: Uuid) -> GatewayResult<Self> {
        if challenger == opponent {
            return Err(validation("you cannot play against yourself"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            player_x: challenger,
            player_o: opponent,
            board: [None; 9],
            turn: Mark::X,
            status: GameStatus::InProgress,
            winner: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == GameStatus::InProgress
    }

    fn player(&self, mark: Mark) -> Uuid {
        match mark {
            Mark::X => self.player_x,
            Mark::O => self.player_o,
        }
    }

    fn mark_of(&self, user_id: Uuid) -> Option<Mark> {
        if user_id == self.player_x {
            Some(Mark::X)
        } else if user_id == self.player_o {
            Some(Mark::O)
        } else {
            None
        }
    }

    pub fn play(&mut self, user_id: Uuid, row: u8, col: u8) -> GatewayResult<()> {
        let mark = self
            .mark_of(user_id)
            .ok_or_else(|| denied("you are not playing this game"))?;
        if !self.is_active() {
            return Err(conflict("game is over"));
        }
        if mark != self.turn {
            return Err(conflict("not your turn"));
        }
        if row > 2 || col > 2 {
            return Err(validation("row and col must be between 0 and 2"));
        }
        let cell = usize::from(row) * 3 + usize::from(col);
        if self.board[cell].is_some() {
            return Err(conflict("cell is already taken"));
        }

        self.board[cell] = Some(mark);
        if LINES
            .iter()
            .any(|line| line.iter().all(|&i| self.board[i] == Some(mark)))
        {
            self.status = match mark {
                Mark::X => GameStatus::XWon,
                Mark::O => GameStatus::OWon,
            };
            self.winner = Some(user_id);
        } else if self.board.iter().all(Option::is_some) {
            self.status = GameStatus::Draw;
        } else {
            self.turn = match mark {
                Mark::X => Mark::O,
                Mark::O => Mark::X,
            };
        }
        Ok(())
    }

    /// The other player wins.
    pub fn resign(&mut self, user_id: Uuid) -> GatewayResult<()> {
        let mark = self
            .mark_of(user_id)
            .ok_or_else(|| denied("you are not playing this game"))?;
        if !self.is_active() {
            return Err(conflict("game is over"));
        }
        self.status = GameStatus::Resigned;
        self.winner = Some(match mark {
            Mark::X => self.player_o,
            Mark::O => self.player_x,
        });
        Ok(())
    }

    pub fn view(&self, room_id: &str) -> GameView {
        let board = self
            .board
            .iter()
            .map(|cell| match cell {
                Some(Mark::X) => 'X',
                Some(Mark::O) => 'O',
                None => '-',
            })
            .collect();
        GameView {
            room_id: room_id.to_string(),
            game_id: self.id,
            board,
            player_x: self.player_x,
            player_o: self.player_o,
            turn: self.is_active().then(|| self.player(self.turn)),
            status: self.status,
            winner: self.winner,
        }
    }
}
