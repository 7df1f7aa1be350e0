//! Built-in lobby handlers served by the `gamewire` binary.

use gamewire_bind::ParamSpec;
use gamewire_server::{HandlerGroup, HandlerRegistry, Route, ServerError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Master code of the lobby group.
pub const LOBBY: i8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    pub code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub code: i32,
    pub name: String,
    pub cards: Vec<Card>,
}

/// A chat line; the whole request bag binds to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    #[serde(default)]
    pub to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Said {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub text: String,
    pub length: usize,
}

/// Session attribute holding the player name set by `enter`.
const PLAYER_NAME: &str = "player.name";

/// Builds the registry of lobby handlers:
///
/// | code  | method   | reply                          |
/// |-------|----------|--------------------------------|
/// | (1,1) | enter    | the player, cards sorted       |
/// | (1,2) | say      | the text, tagged with sender   |
/// | (1,3) | whoami   | the name set by `enter`        |
/// | (1,4) | leave    | none; closes the session       |
pub fn lobby() -> Result<HandlerRegistry, ServerError> {
    let mut registry = HandlerRegistry::new();
    registry.register_group(
        HandlerGroup::new("lobby", LOBBY)
            .route(
                Route::call("enter", 1, |inv| {
                    let cards: HashSet<Card> = inv.arg("cards")?;
                    let mut cards: Vec<Card> = cards.into_iter().collect();
                    cards.sort_by_key(|c| c.code);

                    let player = Player {
                        code: inv.arg("code")?,
                        name: inv.arg("name")?,
                        cards,
                    };
                    inv.session().set_attribute(PLAYER_NAME, player.name.clone());
                    Ok(player)
                })
                .param(ParamSpec::session("session"))
                .param(ParamSpec::bag::<i32>("code"))
                .param(ParamSpec::bag::<String>("name"))
                .param(ParamSpec::bag::<HashSet<Card>>("cards")),
            )
            .route(
                Route::call("say", 2, |inv| {
                    let line: Line = inv.arg("line")?;
                    Ok(Said {
                        from: inv
                            .session()
                            .attribute::<String>(PLAYER_NAME)
                            .map(|name| name.as_ref().clone()),
                        length: line.text.chars().count(),
                        to: line.to,
                        text: line.text,
                    })
                })
                .param(ParamSpec::session("session"))
                .param(ParamSpec::remaining::<Line>("line"))
                .thread_safe(true),
            )
            .route(
                Route::call("whoami", 3, |inv| {
                    Ok(inv
                        .session()
                        .attribute::<String>(PLAYER_NAME)
                        .map(|name| name.as_ref().clone()))
                })
                .param(ParamSpec::session("session"))
                .thread_safe(true),
            )
            .route(
                Route::void("leave", 4, |inv| {
                    inv.session().close();
                    Ok(())
                })
                .param(ParamSpec::session("session")),
            ),
    )?;
    Ok(registry)
}
