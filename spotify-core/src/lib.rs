mod client;
mod oauth;

pub use client::{
    AlbumRef, ApiErrorClass, ArtistRef, CurrentUser, ExternalUrls, Paging, Playlist,
    PlaylistItem, PlaylistOwner, PlaylistTracksRef, SavedTrack, SpotifyClient, SpotifyError,
    Track,
};
pub use oauth::{LIBRARY_READ_SCOPES, OAuthClient, OAuthError, OAuthToken};
