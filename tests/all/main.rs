mod helpers;
mod requests;
